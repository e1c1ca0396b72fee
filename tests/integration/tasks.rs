//! Multi-task fan-out through `add_task` / `run_tasks`.

use anyhow::Result;
use libcapstan::{Opt, Priority, TaskState};

use crate::{dead_endpoint_port, MockServer, WorkerReply};

#[tokio::test]
async fn fan_out_completes_every_task() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("double", |w| {
        let mut out = w.to_vec();
        out.extend_from_slice(w);
        WorkerReply::Complete(out)
    });
    let mut client = server.client();

    let workloads = ["a", "b", "c", "d", "e"];
    let mut ids = Vec::new();
    for w in workloads {
        ids.push(client.add_task("double", None, w, Priority::Normal)?);
    }
    client.run_tasks().await?;

    // Everything finished, so draining takes the whole batch in order.
    let done = client.take_finished();
    assert_eq!(client.task_count(), 0);
    assert_eq!(done.len(), workloads.len());
    for ((task, id), w) in done.iter().zip(ids).zip(workloads) {
        assert_eq!(task.id(), id);
        assert_eq!(task.state(), TaskState::Complete);
        assert_eq!(task.result(), format!("{w}{w}").as_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn send_order_is_priority_then_fifo() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("job", |_| WorkerReply::Complete(Vec::new()));
    let mut client = server.client();

    client.add_task("job", None, "low-1", Priority::Low)?;
    client.add_task("job", None, "low-2", Priority::Low)?;
    client.add_task("job", None, "normal", Priority::Normal)?;
    client.add_task("job", None, "high", Priority::High)?;
    client.run_tasks().await?;

    let order: Vec<Vec<u8>> = server.submissions();
    assert_eq!(
        order,
        vec![
            b"high".to_vec(),
            b"normal".to_vec(),
            b"low-1".to_vec(),
            b"low-2".to_vec(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn endpoint_failure_is_isolated() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("job", |_| WorkerReply::Complete(b"ok".to_vec()));
    let mut client = server.client();
    client.add_server("127.0.0.1", dead_endpoint_port().await?);

    // Round-robin puts tasks 0 and 2 on the live endpoint, 1 and 3 on the
    // refusing one.
    let mut ids = Vec::new();
    for w in ["0", "1", "2", "3"] {
        ids.push(client.add_task("job", None, w, Priority::Normal)?);
    }
    client.run_tasks().await?;

    let states: Vec<TaskState> = ids
        .iter()
        .map(|&id| client.take_task(id).unwrap().state())
        .collect();
    assert_eq!(states[0], TaskState::Complete);
    assert_eq!(states[2], TaskState::Complete);
    assert_eq!(states[1], TaskState::ConnError);
    assert_eq!(states[3], TaskState::ConnError);

    let status = client.endpoint_status();
    assert!(status[0].1, "live endpoint should still hold its socket");
    assert!(!status[1].1);
    assert!(status[1].2.is_some(), "dead endpoint should record its error");
    Ok(())
}

#[tokio::test]
async fn free_tasks_drains_finished_work() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("job", |_| WorkerReply::Complete(Vec::new()));
    let mut client = server.client();
    client.add_option(Opt::FreeTasks);

    client.add_task("job", None, "one", Priority::Normal)?;
    client.add_task("job", None, "two", Priority::Normal)?;
    client.run_tasks().await?;

    assert_eq!(client.task_count(), 0);
    Ok(())
}

#[tokio::test]
async fn clone_shares_endpoints_but_not_tasks() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("job", |w| WorkerReply::Complete(w.to_vec()));
    let mut client = server.client();

    let id = client.add_task("job", None, "original", Priority::Normal)?;
    let mut clone = client.clone_client();
    assert_eq!(clone.endpoints(), client.endpoints());
    assert_eq!(clone.task_count(), 0);

    // The clone works on its own socket while the original's task is still
    // queued.
    let out = clone.do_job("job", None, "cloned").await?;
    assert_eq!(&out[..], b"cloned");
    assert_eq!(client.task_count(), 1);

    client.run_tasks().await?;
    let task = client.take_task(id).unwrap();
    assert_eq!(task.result(), b"original");
    Ok(())
}

#[tokio::test]
async fn namespace_prefix_applies_per_submission() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("ns:job", |_| WorkerReply::Complete(b"prefixed".to_vec()));
    server.worker("job", |_| WorkerReply::Complete(b"plain".to_vec()));
    let mut client = server.client();

    client.set_namespace(b"ns:");
    assert_eq!(&client.do_job("job", None, "").await?[..], b"prefixed");

    // Clearing the namespace stops the prefixing for later submissions.
    client.set_namespace(b"");
    assert_eq!(&client.do_job("job", None, "").await?[..], b"plain");
    Ok(())
}
