#[cfg(test)]
mod test {
    use httpmock::Method::GET;
    use httpmock::{Mock, MockServer};
    use serde_json::{json, Value};

    use crate::errors::ClientError;
    use crate::fhir::references::{ReferenceEntry, ResolveMode};
    use crate::tests::common::static_fhir_client;

    async fn serve<'a>(server: &'a MockServer, path: &str, status: u16, body: Value) -> Mock<'a> {
        server
            .mock_async(|when, then| {
                when.method(GET).path(path);
                then.status(status).json_body(body);
            })
            .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parent_depth_settles_before_child_paths() {
        let server = MockServer::start_async().await;
        let encounter = serve(
            &server,
            "/fhir/Encounter/5",
            200,
            json!({"resourceType": "Encounter", "id": "5", "serviceProvider": {"reference": "Organization/3"}}),
        )
        .await;
        let organization = serve(
            &server,
            "/fhir/Organization/3",
            200,
            json!({"resourceType": "Organization", "id": "3", "name": "General"}),
        )
        .await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let mut observation = json!({
            "resourceType": "Observation",
            "encounter": {"reference": "Encounter/5"}
        });

        // child listed first on purpose
        let cache = fhir
            .resolve_references(
                &mut observation,
                &["encounter.serviceProvider", "encounter"],
                ResolveMode::Graph,
            )
            .await
            .unwrap();

        assert_eq!(observation["encounter"]["resourceType"], "Encounter");
        assert_eq!(observation["encounter"]["serviceProvider"]["name"], "General");
        assert_eq!(cache.len(), 2);
        assert_eq!(encounter.hits_async().await, 1);
        assert_eq!(organization.hits_async().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_paths_and_references_fetch_once() {
        let server = MockServer::start_async().await;
        let patient = serve(&server, "/fhir/Patient/1", 200, json!({"resourceType": "Patient", "id": "1"})).await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let mut observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/1"},
            "performer": [{"reference": "Patient/1"}, {"reference": "Patient/1"}]
        });

        fhir.resolve_references(&mut observation, &["subject", "subject", " performer "], ResolveMode::Graph)
            .await
            .unwrap();

        assert_eq!(patient.hits_async().await, 1);
        assert_eq!(observation["subject"]["id"], "1");
        assert_eq!(observation["performer"][0]["id"], "1");
        assert_eq!(observation["performer"][1]["id"], "1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn not_found_is_skipped_and_siblings_still_resolve() {
        let server = MockServer::start_async().await;
        serve(&server, "/fhir/Patient/1", 200, json!({"resourceType": "Patient", "id": "1"})).await;
        serve(
            &server,
            "/fhir/Practitioner/404",
            404,
            json!({"resourceType": "OperationOutcome", "issue": [{"severity": "error", "code": "not-found"}]}),
        )
        .await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let mut observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/1"},
            "performer": [{"reference": "Practitioner/404"}],
            "specimen": {"reference": "#contained-1"}
        });

        let cache = fhir
            .resolve_references(&mut observation, &["subject", "performer", "specimen"], ResolveMode::Graph)
            .await
            .unwrap();

        assert_eq!(observation["subject"]["resourceType"], "Patient");
        assert_eq!(observation["performer"][0], json!({"reference": "Practitioner/404"}));
        assert_eq!(observation["specimen"], json!({"reference": "#contained-1"}));
        assert_eq!(cache.get("Practitioner/404"), Some(&ReferenceEntry::NotFound));
        assert!(cache.resource("Patient/1").is_some());
        assert!(cache.get("#contained-1").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_error_aborts_the_whole_call() {
        let server = MockServer::start_async().await;
        serve(&server, "/fhir/Patient/1", 200, json!({"resourceType": "Patient", "id": "1"})).await;
        serve(&server, "/fhir/Encounter/9", 500, json!({"resourceType": "OperationOutcome", "issue": []})).await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let mut observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/1"},
            "encounter": {"reference": "Encounter/9"}
        });

        let err = fhir
            .resolve_references(&mut observation, &["subject", "encounter"], ResolveMode::Graph)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Request { .. }));
        assert_eq!(err.status(), Some(http::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bundle_entries_share_one_cache() {
        let server = MockServer::start_async().await;
        let patient = serve(&server, "/fhir/Patient/1", 200, json!({"resourceType": "Patient", "id": "1"})).await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let mut bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [
                {"resource": {"resourceType": "Observation", "id": "a", "subject": {"reference": "Patient/1"}}},
                {"resource": {"resourceType": "Observation", "id": "b", "subject": {"reference": "Patient/1"}}},
                {"fullUrl": "urn:uuid:no-resource"}
            ]
        });

        let cache = fhir
            .resolve_references(&mut bundle, &["subject"], ResolveMode::Graph)
            .await
            .unwrap();

        assert_eq!(patient.hits_async().await, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(bundle["entry"][0]["resource"]["subject"]["id"], "1");
        assert_eq!(bundle["entry"][1]["resource"]["subject"]["id"], "1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flat_mode_leaves_the_root_untouched() {
        let server = MockServer::start_async().await;
        serve(
            &server,
            "/fhir/Encounter/5",
            200,
            json!({"resourceType": "Encounter", "id": "5", "serviceProvider": {"reference": "Organization/3"}}),
        )
        .await;
        serve(&server, "/fhir/Organization/3", 200, json!({"resourceType": "Organization", "id": "3"})).await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let original = json!({
            "resourceType": "Observation",
            "encounter": {"reference": "Encounter/5"}
        });
        let mut observation = original.clone();

        let cache = fhir
            .resolve_references(&mut observation, &["encounter", "encounter.serviceProvider"], ResolveMode::Flat)
            .await
            .unwrap();

        assert_eq!(observation, original);
        assert_eq!(cache.resource("Encounter/5").unwrap()["id"], "5");
        assert_eq!(cache.resource("Organization/3").unwrap()["id"], "3");
        assert_eq!(cache.to_json()["Organization/3"]["resourceType"], "Organization");
    }

    #[tokio::test]
    async fn no_paths_means_no_requests() {
        let (fhir, tokens) = static_fhir_client("http://127.0.0.1:9/fhir");
        let mut observation = json!({"resourceType": "Observation", "subject": {"reference": "Patient/1"}});

        let cache = fhir
            .resolve_references(&mut observation, &["", "  "], ResolveMode::Graph)
            .await
            .unwrap();

        assert!(cache.is_empty());
        assert_eq!(tokens.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn references_to_other_servers_are_not_fetched() {
        let server = MockServer::start_async().await;
        let elsewhere = MockServer::start_async().await;
        let local = serve(&server, "/fhir/Patient/1", 200, json!({"resourceType": "Patient", "id": "1"})).await;
        let foreign = serve(&elsewhere, "/fhir/Patient/2", 200, json!({"resourceType": "Patient", "id": "2"})).await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let foreign_reference = elsewhere.url("/fhir/Patient/2");
        let mut observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": foreign_reference},
            "performer": [{"reference": server.url("/fhir/Patient/1")}],
            "focus": [{"reference": "urn:uuid:0b4d1c2e"}]
        });

        let cache = fhir
            .resolve_references(&mut observation, &["subject", "performer", "focus"], ResolveMode::Graph)
            .await
            .unwrap();

        assert_eq!(foreign.hits_async().await, 0);
        assert_eq!(observation["subject"], json!({"reference": foreign_reference}));
        assert!(cache.get(&foreign_reference).is_none());
        assert_eq!(observation["focus"][0], json!({"reference": "urn:uuid:0b4d1c2e"}));

        // same origin as the base, absolute form still resolves
        assert_eq!(local.hits_async().await, 1);
        assert_eq!(observation["performer"][0]["id"], "1");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reference_cycles_fetch_once() {
        let server = MockServer::start_async().await;
        let encounter = serve(
            &server,
            "/fhir/Encounter/5",
            200,
            json!({"resourceType": "Encounter", "id": "5", "partOf": {"reference": "Encounter/5"}}),
        )
        .await;

        let (fhir, _) = static_fhir_client(&server.url("/fhir"));
        let mut observation = json!({
            "resourceType": "Observation",
            "encounter": {"reference": "Encounter/5"}
        });

        let cache = fhir
            .resolve_references(
                &mut observation,
                &["encounter", "encounter.partOf", "encounter.partOf.partOf"],
                ResolveMode::Graph,
            )
            .await
            .unwrap();

        assert_eq!(encounter.hits_async().await, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(observation["encounter"]["id"], "5");
        assert_eq!(observation["encounter"]["partOf"]["id"], "5");
        assert_eq!(observation["encounter"]["partOf"]["partOf"]["id"], "5");
        // resolution stops at the deepest requested path
        assert_eq!(
            observation["encounter"]["partOf"]["partOf"]["partOf"],
            json!({"reference": "Encounter/5"})
        );
    }
}
