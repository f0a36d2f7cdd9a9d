//! Prometheus instrumentation for the master pipeline.
//!
//! Metrics are registered lazily against the default registry; the process
//! embedding this crate decides how to expose them.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_histogram, register_int_gauge, Gauge, Histogram, IntGauge,
};

pub static USERS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "master_users_total",
        "Number of users in the ranking dataset"
    )
    .expect("register master_users_total")
});

pub static ITEMS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "master_items_total",
        "Number of items in the ranking dataset"
    )
    .expect("register master_items_total")
});

pub static FEEDBACKS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "master_feedbacks_total",
        "Number of positive feedback events in the ranking dataset"
    )
    .expect("register master_feedbacks_total")
});

pub static USER_LABELS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("master_user_labels_total", "Number of distinct user labels")
        .expect("register master_user_labels_total")
});

pub static ITEM_LABELS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("master_item_labels_total", "Number of distinct item labels")
        .expect("register master_item_labels_total")
});

pub static POSITIVE_FEEDBACKS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "master_positive_feedbacks_total",
        "Number of positive rows in the click dataset"
    )
    .expect("register master_positive_feedbacks_total")
});

pub static NEGATIVE_FEEDBACKS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "master_negative_feedbacks_total",
        "Number of negative rows in the click dataset"
    )
    .expect("register master_negative_feedbacks_total")
});

pub static ITEM_NEIGHBOR_INDEX_RECALL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_item_neighbor_index_recall",
        "Observed recall of the approximate item neighbor index"
    )
    .expect("register master_item_neighbor_index_recall")
});

pub static USER_NEIGHBOR_INDEX_RECALL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_user_neighbor_index_recall",
        "Observed recall of the approximate user neighbor index"
    )
    .expect("register master_user_neighbor_index_recall")
});

pub static MATCHING_TOP10_NDCG: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_matching_top10_ndcg",
        "NDCG@10 of the collaborative filtering model"
    )
    .expect("register master_matching_top10_ndcg")
});

pub static MATCHING_TOP10_RECALL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_matching_top10_recall",
        "Recall@10 of the collaborative filtering model"
    )
    .expect("register master_matching_top10_recall")
});

pub static MATCHING_TOP10_PRECISION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_matching_top10_precision",
        "Precision@10 of the collaborative filtering model"
    )
    .expect("register master_matching_top10_precision")
});

pub static RANKING_PRECISION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_ranking_precision",
        "Precision of the click-through rate model"
    )
    .expect("register master_ranking_precision")
});

pub static RANKING_RECALL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "master_ranking_recall",
        "Recall of the click-through rate model"
    )
    .expect("register master_ranking_recall")
});

pub static RANKING_AUC: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("master_ranking_auc", "AUC of the click-through rate model")
        .expect("register master_ranking_auc")
});

pub static FIND_ITEM_NEIGHBORS_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "master_find_item_neighbors_seconds",
        "Time spent searching neighbors of one item"
    )
    .expect("register master_find_item_neighbors_seconds")
});

pub static FIND_USER_NEIGHBORS_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "master_find_user_neighbors_seconds",
        "Time spent searching neighbors of one user"
    )
    .expect("register master_find_user_neighbors_seconds")
});
