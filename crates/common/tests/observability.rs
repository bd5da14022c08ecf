use metrics_exporter_prometheus::PrometheusBuilder;

// Exercises the public `common::observability` surface rather than private layers.

#[test]
fn error_events_counter_increments_on_error_event() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, _otel_guard) = common::observability::build_dispatch("hubd-test", "info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::warn!(investment_id = 7, "not counted");
            tracing::error!(investment_id = 7, "settlement failed");
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains(common::observability::ERROR_EVENTS_METRIC),
        "expected {} in rendered metrics, got:\n{rendered}",
        common::observability::ERROR_EVENTS_METRIC
    );
}
