//! Background submission and status polling.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use libcapstan::{JobHandle, Opt, StatusPoll};

use crate::{MockServer, WorkerReply};

#[tokio::test]
async fn background_jobs_run_exactly_once() -> Result<()> {
    let server = MockServer::start().await?;
    let counter = Arc::new(AtomicI64::new(0));
    server.worker("incr", {
        let counter = Arc::clone(&counter);
        move |w| {
            let n: i64 = std::str::from_utf8(w).unwrap().parse().unwrap();
            counter.fetch_add(n, Ordering::SeqCst);
            WorkerReply::Complete(Vec::new())
        }
    });
    server.worker("read", {
        let counter = Arc::clone(&counter);
        move |_| WorkerReply::Complete(counter.load(Ordering::SeqCst).to_string().into_bytes())
    });
    let mut client = server.client();

    let h1 = client.do_background("incr", None, "10").await?;
    let h2 = client.do_background("incr", None, "14").await?;
    assert_ne!(h1, h2);

    // Each increment ran once: 0 + 10 + 14.
    let result = client.do_job("read", None, "").await?;
    assert_eq!(&result[..], b"24");
    Ok(())
}

#[tokio::test]
async fn background_then_poll_observes_the_lifecycle() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("queued", |_| WorkerReply::Complete(Vec::new()));
    server.delay_background("queued", Duration::from_millis(600));
    let mut client = server.client();

    let handle = client.do_background("queued", None, "w").await?;

    // Not picked up by any worker yet: known, not running, 0/0.
    match client.job_status(&handle).await? {
        StatusPoll::Done(status) => {
            assert!(status.is_known);
            assert!(!status.is_running);
            assert_eq!((status.numerator, status.denominator), (0, 0));
        }
        StatusPoll::Retry => panic!("blocking poll must not ask for a retry"),
    }

    // Eventually the job runs and the server forgets the handle.
    let mut forgotten = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let StatusPoll::Done(status) = client.job_status(&handle).await? {
            if !status.is_known {
                forgotten = true;
                break;
            }
        }
    }
    assert!(forgotten, "job never left the status table");
    Ok(())
}

#[tokio::test]
async fn non_blocking_status_poll_returns_retry_first() -> Result<()> {
    let server = MockServer::start().await?;
    server.worker("queued", |_| WorkerReply::Complete(Vec::new()));
    server.delay_background("queued", Duration::from_millis(200));
    let mut client = server.client();

    let handle = client.do_background("queued", None, "w").await?;
    client.add_option(Opt::NonBlocking);

    // The response cannot be on the wire yet, so the first poll retries.
    let first = client.job_status(&handle).await?;
    assert_eq!(first, StatusPoll::Retry);

    let mut answer = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        match client.job_status(&handle).await? {
            StatusPoll::Done(status) => {
                answer = Some(status);
                break;
            }
            StatusPoll::Retry => {}
        }
    }
    let status = answer.expect("status response never surfaced");
    assert!(status.is_known);
    Ok(())
}

#[tokio::test]
async fn status_of_an_unknown_handle_reports_not_known() -> Result<()> {
    let server = MockServer::start().await?;
    let mut client = server.client();

    let handle = JobHandle::from("H:mock:424242");
    match client.job_status(&handle).await? {
        StatusPoll::Done(status) => {
            assert!(!status.is_known);
            assert!(!status.is_running);
        }
        StatusPoll::Retry => panic!("blocking poll must not ask for a retry"),
    }
    Ok(())
}
