// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;

use common::*;
use omopfed::{
    metrics, AppendOptions, FederationGateway, GetOptions, OmopError, OmopSession, PersonFilter,
    RemoteStage, ServerId, SessionConfig, SessionOptions, Symbol,
};

async fn connect(gateway: Arc<FaultyGateway>) -> OmopSession {
    let shared: Arc<dyn FederationGateway> = gateway;
    OmopSession::connect(shared, SessionOptions::new(resources()))
        .await
        .unwrap()
}

fn asthma_only() -> AppendOptions {
    AppendOptions {
        concepts: Some([ASTHMA].into_iter().collect()),
        ..AppendOptions::default()
    }
}

#[tokio::test]
async fn seeds_one_row_per_subject() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let session = connect(gateway.clone()).await;

    let profile = session.profile().await.unwrap();
    let site = &profile[&ServerId::new("site_a")];
    assert_eq!(site.rows, 100);
    assert_eq!(
        site.column_names(),
        vec!["person_id", "year_of_birth", "gender_concept_id"]
    );
}

#[tokio::test]
async fn concept_filter_leaves_unmatched_subjects_null() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    session.append("condition_occurrence", asthma_only()).await.unwrap();

    let profile = session.profile().await.unwrap();
    let site = &profile[&ServerId::new("site_a")];
    assert_eq!(site.rows, 100);
    let occurrences = site.column("asthma.condition_occurrence_id").unwrap();
    assert_eq!(occurrences.non_null, 40);
    assert_eq!(site.rows - occurrences.non_null, 60);
    assert!(site.column("type_2_diabetes_mellitus_w_out.condition_occurrence_id").is_none());
}

#[tokio::test]
async fn appends_preserve_row_count() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    for table in ["condition_occurrence", "drug_exposure", "measurement", "observation"] {
        session.append(table, AppendOptions::default()).await.unwrap();
        let profile = session.profile().await.unwrap();
        assert_eq!(profile[&ServerId::new("site_a")].rows, 100, "after {table}");
    }
}

#[tokio::test]
async fn ephemeral_symbol_is_removed_after_success() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    session.append("measurement", AppendOptions::default()).await.unwrap();

    let ephemeral = gateway.last_fetched();
    assert_ne!(&ephemeral, session.base());
    assert!(!gateway.is_bound(&ephemeral).await);
    assert!(gateway.is_bound(session.base()).await);
}

#[tokio::test]
async fn fetch_failure_cleans_up_and_surfaces_verbatim() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;
    gateway.set_fault(Fault::AfterFetch);

    let err = session
        .append("measurement", AppendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, OmopError::fetch("injected fetch failure"));
    assert!(!gateway.is_bound(&gateway.last_fetched()).await);
}

#[tokio::test]
async fn merge_failure_cleans_up_and_leaves_base_untouched() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;
    let before = session.profile().await.unwrap();
    gateway.set_fault(Fault::Merge);

    let err = session
        .append("measurement", AppendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OmopError::RemoteOperation { stage: RemoteStage::Merge, .. }
    ));
    assert!(!gateway.is_bound(&gateway.last_fetched()).await);
    assert_eq!(session.profile().await.unwrap(), before);
}

#[tokio::test]
async fn empty_result_is_reported_and_cleaned_up() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    let err = session
        .append(
            "condition_occurrence",
            AppendOptions {
                concepts: Some([999_999].into_iter().collect()),
                ..AppendOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, OmopError::empty_result("condition_occurrence"));
    assert!(!gateway.is_bound(&gateway.last_fetched()).await);
}

#[tokio::test]
async fn half_a_link_pair_is_rejected_before_any_fetch() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;
    let fetches = gateway.fetched.lock().len();

    let err = session
        .append(
            "measurement",
            AppendOptions {
                link_left: Some("person_id".to_string()),
                ..AppendOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OmopError::Configuration { .. }));
    assert_eq!(gateway.fetched.lock().len(), fetches);
}

#[tokio::test]
async fn explicit_link_pair_joins_like_the_default() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    session
        .append(
            "measurement",
            AppendOptions {
                link_left: Some("person_id".to_string()),
                link_right: Some("person_id".to_string()),
                ..AppendOptions::default()
            },
        )
        .await
        .unwrap();
    let profile = session.profile().await.unwrap();
    let site = &profile[&ServerId::new("site_a")];
    assert_eq!(site.column("body_weight.value_as_number").unwrap().non_null, 50);
    assert_eq!(
        site.column_names().iter().filter(|c| **c == "person_id").count(),
        1
    );
}

#[tokio::test]
async fn heuristic_columns_match_prefixed_names() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    session
        .append(
            "drug_exposure",
            AppendOptions {
                columns: Some(set(&["start_date"])),
                expand_columns: true,
                ..AppendOptions::default()
            },
        )
        .await
        .unwrap();

    let profile = session.profile().await.unwrap();
    let site = &profile[&ServerId::new("site_a")];
    assert_eq!(
        site.column("aspirin.drug_exposure_start_date").unwrap().non_null,
        33
    );
    assert!(site.column("aspirin.drug_exposure_id").is_none());
}

#[tokio::test]
async fn repeated_append_disambiguates_with_suffix() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;

    session.append("condition_occurrence", asthma_only()).await.unwrap();
    session.append("condition_occurrence", asthma_only()).await.unwrap();

    let profile = session.profile().await.unwrap();
    let site = &profile[&ServerId::new("site_a")];
    assert_eq!(site.rows, 100);
    assert!(site.column("asthma.condition_occurrence_id").is_some());
    assert_eq!(site.column("asthma.condition_occurrence_id.y").unwrap().non_null, 40);
}

#[tokio::test]
async fn verification_reports_added_columns() {
    let gateway: Arc<dyn FederationGateway> = Arc::new(single_site());
    let config = SessionConfig {
        verify_row_counts: true,
        ..SessionConfig::default()
    };
    let mut session =
        OmopSession::connect(gateway, SessionOptions::new(resources()).with_config(config))
            .await
            .unwrap();

    let summary = session.append("condition_occurrence", asthma_only()).await.unwrap();
    assert_eq!(summary.servers, vec![ServerId::new("site_a")]);
    let added = summary.columns_added.unwrap();
    assert_eq!(added[&ServerId::new("site_a")], 2);
}

async fn verifying_session(gateway: Arc<FaultyGateway>) -> OmopSession {
    let shared: Arc<dyn FederationGateway> = gateway;
    let config = SessionConfig {
        verify_row_counts: true,
        ..SessionConfig::default()
    };
    OmopSession::connect(shared, SessionOptions::new(resources()).with_config(config))
        .await
        .unwrap()
}

#[tokio::test]
async fn verification_catches_a_changed_row_count() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = verifying_session(gateway.clone()).await;
    gateway.set_fault(Fault::DuplicateBaseRow);

    let err = session.append("condition_occurrence", asthma_only()).await.unwrap_err();
    assert!(matches!(
        err,
        OmopError::RemoteOperation { stage: RemoteStage::Verify, ref message }
            if message.contains("100 to 101 rows")
    ));
    assert!(!gateway.is_bound(&gateway.last_fetched()).await);
}

#[tokio::test]
async fn verification_catches_a_missing_base_table() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = verifying_session(gateway.clone()).await;
    gateway.set_fault(Fault::DropBase);

    let err = session.append("measurement", AppendOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        OmopError::RemoteOperation { stage: RemoteStage::Verify, .. }
    ));
    assert!(!gateway.is_bound(&gateway.last_fetched()).await);
    assert!(!gateway.is_bound(session.base()).await);
}

#[tokio::test]
async fn failed_removal_does_not_mask_success() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let mut session = connect(gateway.clone()).await;
    let before = metrics::snapshot().cleanup_failures;
    gateway.set_fault(Fault::Remove);

    session.append("measurement", AppendOptions::default()).await.unwrap();

    assert!(metrics::snapshot().cleanup_failures > before);
    assert!(gateway.is_bound(&gateway.last_fetched()).await);
}

#[tokio::test]
async fn subject_filter_restricts_the_seed() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let session = connect(gateway.clone()).await;
    let cases = Symbol::parse("asthma_cases").unwrap();
    let mut options = GetOptions::new(cases.clone());
    options.concepts = Some([ASTHMA].into_iter().collect());
    session.get("condition_occurrence", options).await.unwrap();

    let shared: Arc<dyn FederationGateway> = gateway.clone();
    let mut cohort_options = SessionOptions::new(resources()).with_base_symbol("asthma_cohort");
    cohort_options.subject_filter = Some(PersonFilter {
        symbol: cases.clone(),
        column: "person_id".to_string(),
    });
    let cohort = OmopSession::connect(shared, cohort_options).await.unwrap();

    let profile = cohort.profile().await.unwrap();
    assert_eq!(profile[&ServerId::new("site_a")].rows, 40);

    session.remove(&cases).await.unwrap();
    assert!(!gateway.is_bound(&cases).await);
}

#[tokio::test]
async fn get_refuses_the_base_symbol() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let session = connect(gateway.clone()).await;

    let err = session
        .get("measurement", GetOptions::new(session.base().clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, OmopError::Configuration { .. }));
}

#[tokio::test]
async fn close_removes_the_base_table() {
    let gateway = Arc::new(FaultyGateway::new(single_site()));
    let session = connect(gateway.clone()).await;
    let base = session.base().clone();

    session.close().await.unwrap();
    assert!(!gateway.is_bound(&base).await);
}

#[tokio::test]
async fn unknown_server_is_a_configuration_error() {
    let gateway: Arc<dyn FederationGateway> = Arc::new(single_site());
    let err = OmopSession::connect(
        gateway,
        SessionOptions::new(resources()).with_servers(["site_z"]),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, OmopError::Configuration { .. }));
}
