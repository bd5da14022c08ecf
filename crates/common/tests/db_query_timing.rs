use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn asyncdb_named_calls_record_latency_and_errors() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Runtime::new().unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let db = common::db::AsyncDb::open(
                tmp.path().to_str().unwrap(),
                common::db::Tables::default(),
            )
            .await
            .unwrap();

            let v: i64 = db.call_named("test.ok", |_conn, _t| Ok(1)).await.unwrap();
            assert_eq!(v, 1);

            let err: anyhow::Result<()> = db
                .call_named("test.err", |conn, _t| {
                    let _ = conn.execute("SELECT * FROM definitely_missing_table", [])?;
                    Ok(())
                })
                .await;
            assert!(err.is_err());

            let tx_err: anyhow::Result<()> = db
                .transaction("test.tx_err", |_tx, _t| Err(anyhow::anyhow!("rejected")))
                .await;
            assert!(tx_err.is_err());
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("hub_db_query_latency_ms"),
        "expected hub_db_query_latency_ms in rendered metrics, got:\n{rendered}"
    );
    assert!(
        rendered.contains("hub_db_query_errors_total"),
        "expected hub_db_query_errors_total in rendered metrics, got:\n{rendered}"
    );
    assert!(rendered.contains("test.tx_err"));
}
