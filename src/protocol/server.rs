//! Worker side of the contract

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::messages::eval_server::{Eval, EvalServer};
use super::messages::{CleanArgs, CompileRequest, CompileResponse, Empty, Test, TestResponse};
use super::{status_from_error, MAX_MESSAGE_LEN};
use crate::error::{EvalError, Result};
use crate::eval::Evaluator;

/// `eval.Eval` service over any evaluator
pub struct EvalService {
    evaluator: Arc<dyn Evaluator>,
}

impl EvalService {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self { evaluator }
    }

    pub fn into_server(self) -> EvalServer<Self> {
        EvalServer::new(self)
            .max_decoding_message_size(MAX_MESSAGE_LEN)
            .max_encoding_message_size(MAX_MESSAGE_LEN)
    }
}

fn failed(method: &str, error: &EvalError) -> Status {
    warn!("{} failed: {}", method, error);
    status_from_error(error)
}

#[tonic::async_trait]
impl Eval for EvalService {
    async fn compile(
        &self,
        request: Request<CompileRequest>,
    ) -> std::result::Result<Response<CompileResponse>, Status> {
        let request = request.into_inner();
        debug!(id = request.id, lang = %request.lang, "Compile");
        let response = self
            .evaluator
            .compile(request)
            .await
            .map_err(|e| failed("Compile", &e))?;
        Ok(Response::new(response))
    }

    async fn execute(
        &self,
        request: Request<Test>,
    ) -> std::result::Result<Response<TestResponse>, Status> {
        let response = self
            .evaluator
            .execute(request.into_inner())
            .await
            .map_err(|e| failed("Execute", &e))?;
        Ok(Response::new(response))
    }

    async fn clean(
        &self,
        request: Request<CleanArgs>,
    ) -> std::result::Result<Response<Empty>, Status> {
        let response = self
            .evaluator
            .clean(request.into_inner())
            .await
            .map_err(|e| failed("Clean", &e))?;
        Ok(Response::new(response))
    }
}

/// Serve the contract on `listener` until the server fails
pub async fn serve(listener: TcpListener, evaluator: Arc<dyn Evaluator>) -> Result<()> {
    serve_with_shutdown(listener, evaluator, std::future::pending()).await
}

/// Serve the contract until `shutdown` resolves; calls in flight finish first
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    evaluator: Arc<dyn Evaluator>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Serving evaluation requests on {}", addr);
    }

    Server::builder()
        .add_service(EvalService::new(evaluator).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| EvalError::Transport(e.to_string()))
}
