//! Server half of the exchange protocol.

use crate::store::IntermediateStore;
use arrow::record_batch::RecordBatch;
use chunk_codec::{decode, encode, TransferMeta, DEFAULT_MAX_CHUNK_BYTES};
use data_types::{EngineError, QueryId};
use generated_types::status_from_engine_error;
use generated_types::stratus::exchange::v1::{
    data_exchange_service_server::DataExchangeService, Chunk, CleanupQueryRequest,
    CleanupQueryResponse, DataRequest, GetAvailablePartitionsRequest,
    GetAvailablePartitionsResponse, TransferResult, TransferStatus,
};
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::TimeProvider;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

/// A chunk stream with no traffic for this long is torn down.
pub const CHUNK_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Destination for final-stage output. Implemented by the coordinator's
/// result buffer; workers run the service without one.
pub trait ResultSink: Send + Sync + Debug + 'static {
    fn put_results(&self, query_id: &QueryId, batch: RecordBatch) -> Result<(), EngineError>;
}

/// tonic server for `StreamData`, `RequestData`, `SendResults` and
/// `GetAvailablePartitions`, backed by the local [`IntermediateStore`].
#[derive(Debug)]
pub struct ExchangeService {
    store: Arc<IntermediateStore>,
    result_sink: Option<Arc<dyn ResultSink>>,
    time_provider: Arc<dyn TimeProvider>,
    max_chunk_bytes: usize,
}

impl ExchangeService {
    /// Worker-side service: stores pushed partitions, serves pulls.
    pub fn new(store: Arc<IntermediateStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            result_sink: None,
            time_provider,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }

    /// Coordinator-side service: additionally accepts `SendResults`.
    pub fn with_result_sink(
        store: Arc<IntermediateStore>,
        time_provider: Arc<dyn TimeProvider>,
        result_sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            store,
            result_sink: Some(result_sink),
            time_provider,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }

    fn complete_transfer(
        store: &IntermediateStore,
        chunks: Vec<Chunk>,
    ) -> Result<TransferResult, EngineError> {
        let transfer_id = chunks[0].transfer_id.clone();
        let query_id = QueryId::new(chunks[0].query_id.as_str());
        let stage_id = chunks[0].stage_id;
        let partition_id = chunks[0].partition_id;
        let chunk_count = chunks.len() as u64;
        let wire_bytes: u64 = chunks.iter().map(|c| c.payload.len() as u64).sum();

        let batch = decode(chunks)?;
        let rows = batch.num_rows() as u64;
        store.put(&query_id, stage_id, partition_id, batch)?;

        debug!(
            query_id=%query_id,
            stage_id,
            partition_id,
            rows,
            wire_bytes,
            "received partition",
        );

        Ok(TransferResult {
            status: TransferStatus::Ok as i32,
            bytes: wire_bytes,
            rows,
            chunks: chunk_count,
            message: String::new(),
            transfer_id,
        })
    }
}

#[tonic::async_trait]
impl DataExchangeService for ExchangeService {
    type StreamDataStream = ReceiverStream<Result<TransferResult, Status>>;

    async fn stream_data(
        &self,
        request: Request<Streaming<Chunk>>,
    ) -> Result<Response<Self::StreamDataStream>, Status> {
        let mut inbound = request.into_inner();
        let store = Arc::clone(&self.store);
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            // chunks buffered per transfer until their last chunk arrives
            let mut transfers: HashMap<String, Vec<Chunk>> = HashMap::new();
            loop {
                let next = tokio::time::timeout(CHUNK_STREAM_IDLE_TIMEOUT, inbound.message());
                match next.await {
                    Ok(Ok(Some(chunk))) => {
                        let transfer_id = chunk.transfer_id.clone();
                        let is_last = chunk.is_last;
                        transfers.entry(transfer_id.clone()).or_default().push(chunk);

                        if is_last {
                            let chunks = transfers
                                .remove(&transfer_id)
                                .expect("transfer buffered above");
                            let reply = Self::complete_transfer(&store, chunks)
                                .map_err(|e| status_from_engine_error(&e));
                            let failed = reply.is_err();
                            if tx.send(reply).await.is_err() || failed {
                                break;
                            }
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(status)) => {
                        warn!(error=%status, "chunk stream aborted by sender");
                        break;
                    }
                    Err(_) => {
                        warn!("chunk stream idle timeout, dropping partial transfers");
                        let _ = tx
                            .send(Err(Status::deadline_exceeded("chunk stream idle timeout")))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type RequestDataStream = ReceiverStream<Result<Chunk, Status>>;

    async fn request_data(
        &self,
        request: Request<DataRequest>,
    ) -> Result<Response<Self::RequestDataStream>, Status> {
        let req = request.into_inner();
        let query_id = QueryId::new(req.query_id.as_str());
        let now = self.time_provider.now();
        let max_chunk_bytes = self.max_chunk_bytes;

        // resolve every batch up front so a missing partition fails the
        // call instead of a half-served stream
        let mut planned = Vec::with_capacity(req.partition_ids.len());
        for partition_id in &req.partition_ids {
            let batch = self
                .store
                .get(&query_id, req.stage_id, *partition_id)
                .ok_or_else(|| {
                    Status::not_found(format!(
                        "partition {} of query {} stage {} not available",
                        partition_id, query_id, req.stage_id
                    ))
                })?;
            planned.push((*partition_id, batch));
        }

        let stage_id = req.stage_id;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for (partition_id, batch) in planned {
                let meta = TransferMeta {
                    transfer_id: uuid::Uuid::new_v4().to_string(),
                    query_id: query_id.clone(),
                    stage_id,
                    partition_id,
                    timestamp: now,
                };
                let chunks = match encode(&batch, &meta, max_chunk_bytes) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        let e = EngineError::from(e);
                        let _ = tx.send(Err(status_from_engine_error(&e))).await;
                        return;
                    }
                };
                for chunk in chunks {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn send_results(
        &self,
        request: Request<Streaming<Chunk>>,
    ) -> Result<Response<TransferResult>, Status> {
        let sink = self
            .result_sink
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| {
                Status::invalid_argument("this process does not accept query results")
            })?;

        let mut inbound = request.into_inner();
        let mut chunks = Vec::new();
        loop {
            let next = tokio::time::timeout(CHUNK_STREAM_IDLE_TIMEOUT, inbound.message());
            match next.await {
                Ok(Ok(Some(chunk))) => chunks.push(chunk),
                Ok(Ok(None)) => break,
                Ok(Err(status)) => return Err(status),
                Err(_) => {
                    return Err(Status::deadline_exceeded("result stream idle timeout"));
                }
            }
        }

        if chunks.is_empty() {
            return Err(Status::invalid_argument("empty result stream"));
        }

        let transfer_id = chunks[0].transfer_id.clone();
        let query_id = QueryId::new(chunks[0].query_id.as_str());
        let chunk_count = chunks.len() as u64;
        let wire_bytes: u64 = chunks.iter().map(|c| c.payload.len() as u64).sum();

        let batch = decode(chunks)
            .map_err(|e| status_from_engine_error(&EngineError::from(e)))?;
        let rows = batch.num_rows() as u64;

        sink.put_results(&query_id, batch)
            .map_err(|e| status_from_engine_error(&e))?;

        Ok(Response::new(TransferResult {
            status: TransferStatus::Ok as i32,
            bytes: wire_bytes,
            rows,
            chunks: chunk_count,
            message: String::new(),
            transfer_id,
        }))
    }

    async fn get_available_partitions(
        &self,
        request: Request<GetAvailablePartitionsRequest>,
    ) -> Result<Response<GetAvailablePartitionsResponse>, Status> {
        let req = request.into_inner();
        let query_id = QueryId::new(req.query_id.as_str());
        let partitions = self
            .store
            .list_partitions(&query_id, req.stage_id)
            .into_iter()
            .map(Into::into)
            .collect();
        Ok(Response::new(GetAvailablePartitionsResponse { partitions }))
    }

    async fn cleanup_query(
        &self,
        request: Request<CleanupQueryRequest>,
    ) -> Result<Response<CleanupQueryResponse>, Status> {
        let req = request.into_inner();
        let query_id = QueryId::new(req.query_id.as_str());
        self.store.cleanup_query(&query_id);
        Ok(Response::new(CleanupQueryResponse { cleaned: true }))
    }
}
