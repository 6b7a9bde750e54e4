//! Control-process side of the contract

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::warn;

use super::messages::eval_client::EvalClient;
use super::{error_from_status, MAX_MESSAGE_LEN};
use super::{CleanArgs, CompileRequest, CompileResponse, Empty, Test, TestResponse};
use crate::error::{EvalError, Result};
use crate::eval::Evaluator;

/// Evaluator that forwards every call to a remote worker.
///
/// Transport problems surface as `EvalError::Transport` or
/// `EvalError::MalformedResponse`, failures reported by the worker as
/// `EvalError::Remote` with the worker's classification.
#[derive(Clone)]
pub struct RemoteEvaluator {
    client: EvalClient<Channel>,
    request_timeout: Duration,
}

impl RemoteEvaluator {
    /// Client for the worker at `addr` (`host:port` or a URI); the
    /// connection is made on first use
    pub fn new(addr: &str) -> Result<Self> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| EvalError::InvalidRequest(format!("bad worker address {:?}: {}", addr, e)))?
            .connect_timeout(Duration::from_secs(5))
            .tcp_nodelay(true);
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        let client = EvalClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_LEN)
            .max_encoding_message_size(MAX_MESSAGE_LEN);
        Self {
            client,
            request_timeout: Duration::from_secs(600),
        }
    }

    /// Upper bound on one call, including time spent waiting for a box
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.request_timeout);
        request
    }

    async fn finish<T, F>(&self, method: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<Response<T>, Status>>,
    {
        let error = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(Ok(response)) => return Ok(response.into_inner()),
            Ok(Err(status)) => error_from_status(&status),
            Err(_) => EvalError::Transport(format!("no reply within {:?}", self.request_timeout)),
        };
        if !matches!(error, EvalError::Remote { .. }) {
            warn!("{} call to worker failed: {}", method, error);
        }
        Err(error)
    }
}

#[async_trait]
impl Evaluator for RemoteEvaluator {
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse> {
        let mut client = self.client.clone();
        self.finish("Compile", client.compile(self.request(request))).await
    }

    async fn execute(&self, test: Test) -> Result<TestResponse> {
        let mut client = self.client.clone();
        self.finish("Execute", client.execute(self.request(test))).await
    }

    async fn clean(&self, args: CleanArgs) -> Result<Empty> {
        let mut client = self.client.clone();
        self.finish("Clean", client.clean(self.request(args))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::error::ErrorKind;
    use crate::eval::LocalEvaluator;
    use crate::languages::LanguageRegistry;
    use crate::protocol::serve;
    use crate::sandbox::fake::{FakeFactory, FakeRun};
    use crate::scheduler::{BoxScheduler, SchedulerConfig};
    use crate::task::compile::CompileLimits;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start_worker(dir: &tempfile::TempDir) -> String {
        let factory = FakeFactory::new(|inv| match inv.command[0].as_str() {
            "g++" if inv.read("main.cpp").is_empty() => {
                FakeRun::exited(1).with_stderr("main.cpp:1:1: error: empty file")
            }
            "g++" => FakeRun::exited(0).with_file("main", "ELF"),
            _ => FakeRun::exited(3).with_stdout(inv.stdin.to_ascii_uppercase()),
        });
        let evaluator = LocalEvaluator::new(
            BoxScheduler::new(SchedulerConfig::default(), Arc::new(factory)),
            Arc::new(LanguageRegistry::builtin().unwrap()),
            ArtifactStore::new(dir.path()),
            CompileLimits::default(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, Arc::new(evaluator)));
        addr
    }

    fn compile_request(id: i64, code: &[u8]) -> CompileRequest {
        let mut req = CompileRequest {
            id,
            lang: "cpp17".into(),
            ..Default::default()
        };
        req.code_files.insert("main.cpp".into(), code.to_vec());
        req
    }

    #[tokio::test]
    async fn test_remote_round() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteEvaluator::new(&start_worker(&dir).await).unwrap();

        let resp = remote.compile(compile_request(5, b"int main(){}")).await.unwrap();
        assert!(resp.success);
        assert!(dir.path().join("5.bin").exists());

        let resp = remote
            .execute(Test {
                id: 5,
                lang: "cpp17".into(),
                input: b"hello".to_vec(),
                time_limit: 1.0,
                memory_limit: 65536,
                console_input: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.output, b"HELLO");
        assert_eq!(resp.stats.unwrap().exit_code, 3);

        remote.clean(CleanArgs { id: 5 }).await.unwrap();
        remote.clean(CleanArgs { id: 5 }).await.unwrap();
        assert!(!dir.path().join("5.bin").exists());
    }

    #[tokio::test]
    async fn test_compile_failure_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteEvaluator::new(&start_worker(&dir).await).unwrap();

        let resp = remote.compile(compile_request(6, b"")).await.unwrap();
        assert!(!resp.success);
        assert!(resp.other.contains("empty file"));
    }

    #[tokio::test]
    async fn test_worker_errors_keep_their_kind() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteEvaluator::new(&start_worker(&dir).await).unwrap();

        let mut req = compile_request(1, b"x");
        req.lang = "cobol".into();
        let err = remote.compile(req).await.unwrap_err();
        assert!(matches!(err, EvalError::Remote { kind: ErrorKind::User, .. }));
        assert!(!err.is_transport());

        let err = remote
            .execute(Test {
                id: 99,
                lang: "cpp17".into(),
                time_limit: 1.0,
                console_input: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_unreachable_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let remote = RemoteEvaluator::new(&addr).unwrap();
        let err = remote.clean(CleanArgs { id: 1 }).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_not_a_worker() {
        // Speaks plain TCP, never HTTP/2
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"HTTP/1.0 400 Bad Request\r\n\r\n").await.unwrap();
        });

        let remote = RemoteEvaluator::new(&addr)
            .unwrap()
            .with_request_timeout(Duration::from_secs(5));
        let err = remote.clean(CleanArgs { id: 1 }).await.unwrap_err();
        assert!(!matches!(err, EvalError::Remote { .. }));
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_bad_address() {
        let err = RemoteEvaluator::new("not a uri").err().unwrap();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let remote = RemoteEvaluator::new(&addr)
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        let err = remote.clean(CleanArgs { id: 1 }).await.unwrap_err();
        assert!(err.is_transport());
    }
}
