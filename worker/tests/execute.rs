//! Worker RPC tests: a real server per worker, driven through the
//! execution client.

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use data_exchange::{
    ConnectionPool, ExchangeService, ExchangeTransport, IntermediateStore, TransportConfig,
};
use data_types::{
    DataPartition, Partitioning, QueryId, StageType, WorkerEndpoint, WorkerId, WorkerResources,
};
use futures::StreamExt;
use generated_types::stratus::exchange::v1::data_exchange_service_server::DataExchangeServiceServer;
use generated_types::stratus::execution::v1::{
    execution_service_client::ExecutionServiceClient,
    execution_service_server::ExecutionServiceServer, CancelQueryRequest, ExecuteStageRequest,
    ReportHealthRequest, StageLocation, StageStatus as StageStatusProto, StreamProgressRequest,
};
use generated_types::stratus::plan::v1::{
    stage_plan::Operator, AggregateExpr, AggregateFunction, AggregateMode, AggregateOperator,
    ScanOperator, StagePlan,
};
use generated_types::Message;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::{SystemProvider, TimeProvider};
use test_helpers::timeout::FutureTimeout;
use tokio_stream::wrappers::TcpListenerStream;
use worker::{
    ExecutionRpcService, InMemoryTableSource, ProgressHub, QueryTracker, StageExecutor,
    StaticResourceMonitor,
};

struct TestWorker {
    endpoint: WorkerEndpoint,
    store: Arc<IntermediateStore>,
}

async fn start_worker(name: &str, source: Arc<InMemoryTableSource>) -> TestWorker {
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let store = Arc::new(IntermediateStore::default());
    let tracker = Arc::new(QueryTracker::new());
    let progress = Arc::new(ProgressHub::new(Arc::clone(&time_provider)));
    let transport = Arc::new(ExchangeTransport::new(
        Arc::new(ConnectionPool::default()),
        TransportConfig::default(),
        Arc::clone(&time_provider),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = WorkerEndpoint::new(listener.local_addr().unwrap().to_string());

    let executor = Arc::new(StageExecutor::new(
        WorkerId::new(name),
        Arc::clone(&store),
        transport,
        source,
        Arc::clone(&progress),
        Arc::clone(&tracker),
        Arc::clone(&time_provider),
    ));

    let execution = ExecutionRpcService::new(
        executor,
        progress,
        tracker,
        WorkerId::new(name),
        endpoint.clone(),
        Arc::new(StaticResourceMonitor::new(WorkerResources {
            cpu_cores: 4,
            memory_mb: 1024,
            disk_mb: 1024,
            active_queries: 0,
            cpu_util: 0.1,
            mem_util: 0.1,
        })),
        Arc::clone(&time_provider),
    );
    let exchange = ExchangeService::new(Arc::clone(&store), time_provider);

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(ExecutionServiceServer::new(execution))
            .add_service(DataExchangeServiceServer::new(exchange))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    TestWorker { endpoint, store }
}

fn orders(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("category", DataType::Utf8, false),
    ]));
    let categories: Vec<&str> = ["A", "B", "C"].iter().cycle().take(rows).copied().collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(0..rows as i64)),
            Arc::new(StringArray::from(categories)),
        ],
    )
    .unwrap()
}

fn scan_request(query_id: &str, partitioning: Partitioning) -> ExecuteStageRequest {
    let plan = StagePlan {
        operator: Some(Operator::Scan(ScanOperator {
            table: "orders".to_string(),
            columns: vec![],
        })),
    };
    let stage = data_types::Stage {
        stage_id: 1,
        stage_type: StageType::Scan,
        serialized_plan: plan.encode_to_vec().into(),
        input_partitions: vec![DataPartition {
            id: 0,
            file_refs: vec!["orders-0".to_string()],
            est_rows: 15,
            est_bytes: 0,
        }],
        output_partitioning: partitioning,
        depends_on: vec![],
    };
    ExecuteStageRequest {
        query_id: query_id.to_string(),
        stage: Some(stage.into()),
        assigned_partitions: vec![],
        upstream_locations: vec![],
        exchange_targets: vec![],
        coordinator_endpoint: String::new(),
        trace_id: "trace-1".to_string(),
    }
}

async fn client(endpoint: &WorkerEndpoint) -> ExecutionServiceClient<client_util::connection::Connection> {
    let connection = client_util::connection::Builder::new()
        .build(endpoint.http_uri())
        .await
        .unwrap();
    ExecutionServiceClient::new(connection)
}

#[tokio::test]
async fn execute_scan_then_remote_aggregate() {
    test_helpers::maybe_start_logging();

    let source = Arc::new(InMemoryTableSource::new());
    source.register("orders-0", vec![orders(15)]);
    let w1 = start_worker("w-1", Arc::clone(&source)).await;
    let w2 = start_worker("w-2", Arc::new(InMemoryTableSource::new())).await;

    // scan on w1, hash partitioned by category
    let mut c1 = client(&w1.endpoint).await;
    let scan = c1
        .execute_stage(scan_request(
            "q-e2e",
            Partitioning::hash(vec!["category".to_string()], 4),
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(scan.status, StageStatusProto::Succeeded as i32);
    assert!(!scan.produced_partitions.is_empty());

    // aggregate on w2, pulling w1's partitions
    let plan = StagePlan {
        operator: Some(Operator::Aggregate(AggregateOperator {
            group_columns: vec!["category".to_string()],
            aggregates: vec![AggregateExpr {
                function: AggregateFunction::Count as i32,
                column: String::new(),
                output_name: "count".to_string(),
            }],
            mode: AggregateMode::Partial as i32,
        })),
    };
    let stage = data_types::Stage {
        stage_id: 2,
        stage_type: StageType::Aggregate,
        serialized_plan: plan.encode_to_vec().into(),
        input_partitions: vec![],
        output_partitioning: Partitioning::single(),
        depends_on: vec![1],
    };

    let mut c2 = client(&w2.endpoint).await;
    let aggregate = c2
        .execute_stage(ExecuteStageRequest {
            query_id: "q-e2e".to_string(),
            stage: Some(stage.into()),
            assigned_partitions: vec![],
            upstream_locations: vec![StageLocation {
                stage_id: 1,
                worker_endpoints: vec![w1.endpoint.to_string()],
            }],
            exchange_targets: vec![],
            coordinator_endpoint: String::new(),
            trace_id: "trace-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(aggregate.status, StageStatusProto::Succeeded as i32);
    let produced: u64 = aggregate.produced_partitions.iter().map(|p| p.rows).sum();
    // three categories, one output row each
    assert_eq!(produced, 3);

    let result = w2.store.get(&QueryId::new("q-e2e"), 2, 0).unwrap();
    let counts = result
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    let total: i64 = counts.values().iter().sum();
    assert_eq!(total, 15);
}

#[tokio::test]
async fn exchange_stage_shuffles_to_its_targets() {
    let source = Arc::new(InMemoryTableSource::new());
    source.register("orders-0", vec![orders(15)]);
    let w1 = start_worker("w-1", Arc::clone(&source)).await;
    let w2 = start_worker("w-2", Arc::new(InMemoryTableSource::new())).await;
    let w3 = start_worker("w-3", Arc::new(InMemoryTableSource::new())).await;

    let mut c1 = client(&w1.endpoint).await;
    c1.execute_stage(scan_request("q-exchange", Partitioning::single()))
        .await
        .unwrap();

    let plan = StagePlan {
        operator: Some(Operator::Exchange(
            generated_types::stratus::plan::v1::ExchangeOperator {},
        )),
    };
    let stage = data_types::Stage {
        stage_id: 2,
        stage_type: StageType::Exchange,
        serialized_plan: plan.encode_to_vec().into(),
        input_partitions: vec![],
        output_partitioning: Partitioning::hash(vec!["category".to_string()], 4),
        depends_on: vec![1],
    };
    let response = c1
        .execute_stage(ExecuteStageRequest {
            query_id: "q-exchange".to_string(),
            stage: Some(stage.into()),
            assigned_partitions: vec![],
            upstream_locations: vec![StageLocation {
                stage_id: 1,
                worker_endpoints: vec![w1.endpoint.to_string()],
            }],
            exchange_targets: vec![w2.endpoint.to_string(), w3.endpoint.to_string()],
            coordinator_endpoint: String::new(),
            trace_id: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status, StageStatusProto::Succeeded as i32);

    // partition i lands on targets[i % 2]; all 15 rows arrive somewhere
    let query_id = QueryId::new("q-exchange");
    let mut total = 0;
    for (index, store) in [&w2.store, &w3.store].iter().enumerate() {
        for info in store.list_partitions(&query_id, 2) {
            assert_eq!((info.partition_id as usize) % 2, index);
            total += info.rows;
        }
    }
    assert_eq!(total, 15);
}

#[tokio::test]
async fn progress_stream_delivers_terminal_update() {
    let source = Arc::new(InMemoryTableSource::new());
    source.register("orders-0", vec![orders(6)]);
    let w = start_worker("w-progress", source).await;

    let mut c = client(&w.endpoint).await;
    let mut progress = c
        .stream_progress(StreamProgressRequest {
            query_id: "q-progress".to_string(),
            trace_id: String::new(),
        })
        .await
        .unwrap()
        .into_inner();

    let collector = tokio::spawn(async move {
        let mut updates = Vec::new();
        while let Some(Ok(update)) = progress.next().await {
            let terminal = update.status == StageStatusProto::Succeeded as i32;
            updates.push(update);
            if terminal {
                break;
            }
        }
        updates
    });

    // let the subscriber attach before running the stage
    tokio::time::sleep(Duration::from_millis(50)).await;
    c.execute_stage(scan_request("q-progress", Partitioning::single()))
        .await
        .unwrap();

    let updates = collector
        .with_timeout_panic(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!updates.is_empty());
    let last = updates.last().unwrap();
    assert_eq!(last.status, StageStatusProto::Succeeded as i32);
    assert_eq!(last.percent, 1.);
    assert_eq!(last.trace_id, "trace-1");
    assert!(updates.iter().all(|u| u.query_id == "q-progress"));
}

#[tokio::test]
async fn cancel_without_running_query_reports_false() {
    let w = start_worker("w-cancel", Arc::new(InMemoryTableSource::new())).await;
    let mut c = client(&w.endpoint).await;

    let response = c
        .cancel_query(CancelQueryRequest {
            query_id: "q-idle".to_string(),
            reason: "test".to_string(),
            trace_id: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!response.cancelled);
}

#[tokio::test]
async fn report_health_reflects_tracker_state() {
    let w = start_worker("w-health", Arc::new(InMemoryTableSource::new())).await;
    let mut c = client(&w.endpoint).await;

    let response = c
        .report_health(ReportHealthRequest {
            worker_id: "w-health".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let info = response.info.unwrap();
    assert_eq!(info.worker_id, "w-health");
    assert_eq!(info.resources.unwrap().active_queries, 0);
}
