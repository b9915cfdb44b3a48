//! Client side of the exchange protocol.
//!
//! Every operation is wrapped in bounded exponential-backoff retry keyed on
//! the engine error kind; non-retryable errors surface immediately. A
//! failed `StreamData` transfer is retried under a fresh transfer id so a
//! partial buffer on the receiver can never be spliced into the retry.

use crate::pool::ConnectionPool;
use backoff::{Backoff, BackoffConfig};
use arrow::record_batch::RecordBatch;
use chunk_codec::{decode, encode, TransferMeta, DEFAULT_MAX_CHUNK_BYTES};
use data_types::{
    EngineError, PartitionInfo, QueryId, TransferResult, TransferStatus, WorkerEndpoint,
};
use generated_types::engine_error_from_status;
use generated_types::stratus::exchange::v1::{
    data_exchange_service_client::DataExchangeServiceClient, Chunk, CleanupQueryRequest,
    DataRequest, GetAvailablePartitionsRequest, TransferResult as TransferResultProto,
};
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use std::sync::Arc;
use stratus_time::TimeProvider;
use tonic::Request;

/// Tunables for the exchange transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_chunk_bytes: usize,
    pub backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Worker-to-worker (and worker-to-coordinator) partition transfer client.
#[derive(Debug)]
pub struct ExchangeTransport {
    pool: Arc<ConnectionPool>,
    config: TransportConfig,
    time_provider: Arc<dyn TimeProvider>,
}

impl ExchangeTransport {
    pub fn new(
        pool: Arc<ConnectionPool>,
        config: TransportConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            pool,
            config,
            time_provider,
        }
    }

    /// The pool, for sharing with other clients of the same endpoints.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Stream one partition to `target`, which stores it and replies with a
    /// [`TransferResult`].
    pub async fn send_partition(
        &self,
        target: &WorkerEndpoint,
        query_id: &QueryId,
        stage_id: u64,
        partition_id: u64,
        batch: &RecordBatch,
    ) -> Result<TransferResult, EngineError> {
        self.retry("send_partition", || async {
            self.send_once(target, query_id, stage_id, partition_id, batch)
                .await
        })
        .await
        .map_err(|e| {
            e.scope_query(query_id.clone()).scope_stage(stage_id)
        })
    }

    async fn send_once(
        &self,
        target: &WorkerEndpoint,
        query_id: &QueryId,
        stage_id: u64,
        partition_id: u64,
        batch: &RecordBatch,
    ) -> Result<TransferResult, EngineError> {
        let meta = TransferMeta {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            query_id: query_id.clone(),
            stage_id,
            partition_id,
            timestamp: self.time_provider.now(),
        };
        let chunks = encode(batch, &meta, self.config.max_chunk_bytes)?;
        let chunk_count = chunks.len();

        let connection = self.pool.get(target).await?;
        let mut client = DataExchangeServiceClient::new(connection);

        let outbound = futures::stream::iter(chunks);
        let mut inbound = client
            .stream_data(Request::new(outbound))
            .await
            .map_err(engine_error_from_status)?
            .into_inner();

        let result = inbound
            .message()
            .await
            .map_err(engine_error_from_status)?
            .ok_or_else(|| {
                EngineError::unavailable("stream closed before a transfer result arrived")
            })?;

        debug!(
            target=%target,
            query_id=%query_id,
            stage_id,
            partition_id,
            chunks=chunk_count,
            "sent partition",
        );
        into_domain_result(result)
    }

    /// Fetch `partition_ids` from the worker that produced them, in the
    /// requested order.
    pub async fn request_partitions(
        &self,
        source: &WorkerEndpoint,
        query_id: &QueryId,
        stage_id: u64,
        partition_ids: &[u64],
    ) -> Result<Vec<RecordBatch>, EngineError> {
        self.retry("request_partitions", || async {
            self.request_once(source, query_id, stage_id, partition_ids)
                .await
        })
        .await
        .map_err(|e| e.scope_query(query_id.clone()).scope_stage(stage_id))
    }

    async fn request_once(
        &self,
        source: &WorkerEndpoint,
        query_id: &QueryId,
        stage_id: u64,
        partition_ids: &[u64],
    ) -> Result<Vec<RecordBatch>, EngineError> {
        let connection = self.pool.get(source).await?;
        let mut client = DataExchangeServiceClient::new(connection);

        let mut inbound = client
            .request_data(Request::new(DataRequest {
                query_id: query_id.to_string(),
                stage_id,
                partition_ids: partition_ids.to_vec(),
                trace_id: String::new(),
            }))
            .await
            .map_err(engine_error_from_status)?
            .into_inner();

        let mut grouped: HashMap<u64, Vec<Chunk>> = HashMap::new();
        while let Some(chunk) = inbound.message().await.map_err(engine_error_from_status)? {
            grouped.entry(chunk.partition_id).or_default().push(chunk);
        }

        partition_ids
            .iter()
            .map(|id| {
                let chunks = grouped.remove(id).ok_or_else(|| {
                    EngineError::not_found(format!("partition {} not in response", id))
                })?;
                decode(chunks).map_err(Into::into)
            })
            .collect()
    }

    /// Deliver the identical batch to every target under partition id 0.
    pub async fn broadcast(
        &self,
        query_id: &QueryId,
        stage_id: u64,
        batch: &RecordBatch,
        targets: &[WorkerEndpoint],
    ) -> Result<(), EngineError> {
        futures::future::try_join_all(
            targets
                .iter()
                .map(|target| self.send_partition(target, query_id, stage_id, 0, batch)),
        )
        .await?;
        Ok(())
    }

    /// Hash-partition `batch` and send partition `i` to
    /// `targets[i % targets.len()]`; sends run concurrently.
    pub async fn shuffle(
        &self,
        query_id: &QueryId,
        stage_id: u64,
        batch: &RecordBatch,
        partition_columns: &[String],
        partition_count: u32,
        targets: &[WorkerEndpoint],
    ) -> Result<(), EngineError> {
        if targets.is_empty() {
            return Err(EngineError::invalid_request("shuffle requires targets")
                .scope_query(query_id.clone())
                .scope_stage(stage_id));
        }

        let partitions = chunk_codec::hash_partition(batch, partition_columns, partition_count)?;
        futures::future::try_join_all(partitions.iter().map(|(partition_id, part)| {
            let target = &targets[(*partition_id as usize) % targets.len()];
            self.send_partition(target, query_id, stage_id, *partition_id, part)
        }))
        .await?;
        Ok(())
    }

    /// Partitions available for `(query, stage)` on `source`.
    pub async fn list_available(
        &self,
        source: &WorkerEndpoint,
        query_id: &QueryId,
        stage_id: u64,
    ) -> Result<Vec<PartitionInfo>, EngineError> {
        self.retry("list_available", || async {
            let connection = self.pool.get(source).await?;
            let mut client = DataExchangeServiceClient::new(connection);
            let response = client
                .get_available_partitions(Request::new(GetAvailablePartitionsRequest {
                    query_id: query_id.to_string(),
                    stage_id,
                }))
                .await
                .map_err(engine_error_from_status)?
                .into_inner();
            Ok(response.partitions.into_iter().map(Into::into).collect())
        })
        .await
    }

    /// Final-stage output delivery to the coordinator's result buffer.
    pub async fn send_results(
        &self,
        target: &WorkerEndpoint,
        query_id: &QueryId,
        stage_id: u64,
        batch: &RecordBatch,
    ) -> Result<TransferResult, EngineError> {
        self.retry("send_results", || async {
            let meta = TransferMeta {
                transfer_id: uuid::Uuid::new_v4().to_string(),
                query_id: query_id.clone(),
                stage_id,
                partition_id: 0,
                timestamp: self.time_provider.now(),
            };
            let chunks = encode(batch, &meta, self.config.max_chunk_bytes)?;

            let connection = self.pool.get(target).await?;
            let mut client = DataExchangeServiceClient::new(connection);
            let result = client
                .send_results(Request::new(futures::stream::iter(chunks)))
                .await
                .map_err(engine_error_from_status)?
                .into_inner();
            into_domain_result(result)
        })
        .await
        .map_err(|e| e.scope_query(query_id.clone()).scope_stage(stage_id))
    }

    /// Ask `target` to drop every intermediate partition of `query_id`.
    /// Idempotent on the receiver.
    pub async fn cleanup_query(
        &self,
        target: &WorkerEndpoint,
        query_id: &QueryId,
    ) -> Result<(), EngineError> {
        self.retry("cleanup_query", || async {
            let connection = self.pool.get(target).await?;
            let mut client = DataExchangeServiceClient::new(connection);
            client
                .cleanup_query(Request::new(CleanupQueryRequest {
                    query_id: query_id.to_string(),
                    trace_id: String::new(),
                }))
                .await
                .map_err(engine_error_from_status)?;
            Ok(())
        })
        .await
        .map_err(|e| e.scope_query(query_id.clone()))
    }

    async fn retry<F, F1, T>(&self, task_name: &str, do_stuff: F) -> Result<T, EngineError>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<T, EngineError>> + Send,
        T: Send,
    {
        Backoff::new(&self.config.backoff)
            .retry(task_name, |e: &EngineError| e.kind().is_retryable(), do_stuff)
            .await
    }
}

fn into_domain_result(result: TransferResultProto) -> Result<TransferResult, EngineError> {
    let result: TransferResult = result
        .try_into()
        .map_err(|e: generated_types::FieldViolation| EngineError::internal(e.to_string()))?;
    match result.status {
        TransferStatus::Ok => Ok(result),
        TransferStatus::Error => Err(EngineError::internal(
            result
                .message
                .unwrap_or_else(|| "transfer failed on receiver".to_string()),
        )),
    }
}
