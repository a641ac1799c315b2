//! End-to-end tests against the `enginecore-echo-worker` binary.

use std::sync::Arc;
use std::time::Duration;

use enginecore::{
    ClientConfig, ClientError, EngineCoreClient, EngineCoreRequest, LoraRequest, ProcessLauncher,
    WorkerLauncher, make_client,
};

const STARTUP: Duration = Duration::from_secs(60);

fn echo_worker() -> ProcessLauncher {
    ProcessLauncher::new(env!("CARGO_BIN_EXE_enginecore-echo-worker"))
}

fn config(launcher: ProcessLauncher) -> ClientConfig {
    let launcher: Arc<dyn WorkerLauncher> = Arc::new(launcher);
    ClientConfig::from_launcher(launcher).with_startup_timeout(STARTUP)
}

#[test]
fn echo_worker_returns_requests_in_order() {
    let client = make_client(config(echo_worker())).unwrap();

    client.add_request(EngineCoreRequest::new("r1", vec![1, 2])).unwrap();
    client.add_request(EngineCoreRequest::new("r2", vec![3])).unwrap();

    let first = client.get_output().unwrap();
    let second = client.get_output().unwrap();
    assert_eq!(first.request_ids().collect::<Vec<_>>(), ["r1"]);
    assert_eq!(first.outputs[0].new_token_ids, vec![1, 2]);
    assert_eq!(second.request_ids().collect::<Vec<_>>(), ["r2"]);

    assert!(client.add_lora(LoraRequest::new("a", 5, "/a")).unwrap());
    assert!(client.pin_lora(5).unwrap());

    client.shutdown();
    assert!(!client.is_engine_dead());
}

#[test]
fn worker_crash_marks_engine_dead() {
    let client = make_client(config(
        echo_worker().with_env("ENGINECORE_ECHO_FAIL_AFTER_STEPS", "0"),
    ))
    .unwrap();

    client.add_request(EngineCoreRequest::new("r1", vec![1])).unwrap();
    assert!(matches!(client.get_output(), Err(ClientError::EngineDead)));
    assert!(matches!(client.sleep(1), Err(ClientError::EngineDead)));
    assert!(matches!(
        client.add_request(EngineCoreRequest::new("r2", vec![1])),
        Err(ClientError::EngineDead)
    ));
    assert!(client.health().errored);
}

#[test]
fn worker_startup_failure_is_reported() {
    let result = make_client(config(
        echo_worker().with_env("ENGINECORE_ECHO_FAIL_STARTUP", "no gpu"),
    ));
    match result {
        Err(ClientError::Startup(message)) => assert!(message.contains("no gpu")),
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("client should not start"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_client_against_worker_process() {
    let client = make_client(config(echo_worker()).with_asyncio(true)).unwrap();

    client
        .add_request_async(EngineCoreRequest::new("r1", vec![4]))
        .await
        .unwrap();
    let (outputs, loras) = tokio::join!(client.get_output_async(), client.list_loras_async());
    assert_eq!(outputs.unwrap().request_ids().collect::<Vec<_>>(), ["r1"]);
    assert!(loras.unwrap().is_empty());

    client
        .abort_requests_async(&["never-added".to_string()])
        .await
        .unwrap();
    client.shutdown();
    assert!(matches!(
        client.get_output_async().await,
        Err(ClientError::ShutDown)
    ));
}
