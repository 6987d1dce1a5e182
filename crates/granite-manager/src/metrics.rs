// Copyright (c) Granite Contributors
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics exported by the Blob Manager.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

macro_rules! register_manager_metric {
    ($metric_type:ty, $registry:ident, $opts:expr) => {{
        let metric = <$metric_type>::with_opts($opts).unwrap();
        $registry
            .register(Box::new(metric.clone()))
            .map(|()| metric)
            .expect("metrics defined at compile time must be valid")
    }};
    ($metric_type:ty, $registry:ident, $opts:expr, $label_names:expr) => {{
        let metric = <$metric_type>::new($opts.into(), $label_names).unwrap();
        $registry
            .register(Box::new(metric.clone()))
            .map(|()| metric)
            .expect("metrics defined at compile time must be valid")
    }};
}

macro_rules! define_manager_metric_set {
    (
        $(
            $metric_type:path: [
                $(( $metric:ident, $descr:literal $(, $labels:expr )? )),+ $(,)?
            ]
        ),+ $(,)?
    ) => {
        #[derive(Debug)]
        pub struct ManagerMetricSet {
            $($( pub $metric: $metric_type ),*),*
        }

        impl ManagerMetricSet {
            pub fn new(registry: &Registry) -> Self {
                Self { $($(
                    $metric: register_manager_metric!(
                        $metric_type,
                        registry,
                        Opts::new(stringify!($metric), $descr).namespace("granite_blob_manager")
                        $(, $labels)?
                    )
                ),*),*}
            }
        }
    };
}

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_RETRIED: &str = "retried";
pub const OUTCOME_CONFLICT: &str = "conflict";

define_manager_metric_set! {
    IntCounter: [
        (granule_splits_total, "Granule splits committed"),
        (split_downsamples_total, "Splits downsampled to the fanout cap"),
        (workers_recruited_total, "Blob workers successfully recruited"),
        (workers_killed_total, "Blob workers torn down"),
        (granules_fully_deleted_total, "Granules fully deleted by GC"),
        (granules_partially_deleted_total, "Granules partially deleted by GC"),
        (prune_errors_total, "Prune sweeps that failed and were dropped"),
    ],
    IntCounterVec: [
        (range_assignments_total, "Assign requests dispatched to workers", &["outcome"]),
        (range_revokes_total, "Revoke requests dispatched to workers", &["outcome"]),
    ],
    IntGauge: [
        (current_epoch, "Epoch of this manager incarnation"),
        (live_workers, "Blob workers currently monitored"),
        (assigned_granules, "Granule ranges currently mapped to a worker"),
    ],
}

impl ManagerMetricSet {
    /// A metric set registered nowhere, for tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_test() -> Self {
        Self::new(&Registry::new())
    }
}
