use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{info, o, warn, Drain, Logger};

use rpc_client_pool::connection::ConnectionError;
use rpc_client_pool::connection_pool::types::ConnectionPoolOptions;
use rpc_client_pool::connection_pool::ConnectionPool;

#[derive(Debug)]
pub struct DummyClient {
    id: u32,
    requests: u32,
}

impl DummyClient {
    fn call(&mut self) {
        self.requests += 1;
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic pool example");

    let next_id = Arc::new(AtomicU32::new(0));

    // Every third client reports itself dead on its first keepalive probe so
    // the recovery loop has something to do.
    let pool_opts = ConnectionPoolOptions {
        name: String::from("example"),
        dial: Some(Box::new(
            move |_tag: &str| -> Result<DummyClient, ConnectionError> {
                Ok(DummyClient {
                    id: next_id.fetch_add(1, Ordering::SeqCst),
                    requests: 0,
                })
            },
        )),
        close: Some(Box::new(
            |_tag: &str, _client: DummyClient| -> Result<(), ConnectionError> {
                Ok(())
            },
        )),
        keepalive: Some(Box::new(
            |_tag: &str,
             client: &mut DummyClient|
             -> Result<(), ConnectionError> {
                if client.id % 3 == 2 {
                    Err(format!("client {} stopped responding", client.id)
                        .into())
                } else {
                    Ok(())
                }
            },
        )),
        max_pool_size: 3,
        initial_pool_size: 3,
        acquire_wait: Some(Duration::from_millis(200)),
        keepalive_interval: Some(Duration::from_millis(500)),
        dial_retry_interval: Some(Duration::from_millis(750)),
        log: Some(log.clone()),
        ..Default::default()
    };

    let pool = Arc::new(
        ConnectionPool::new(pool_opts).expect("valid pool configuration"),
    );

    let barrier1 = Arc::new(Barrier::new(4));
    let barrier2 = Arc::new(Barrier::new(4));

    let threads: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let barrier1 = barrier1.clone();
            let barrier2 = barrier2.clone();
            thread::spawn(move || {
                let mut conn = pool.claim().expect("idle connection");
                conn.call();
                barrier1.wait();
                barrier2.wait();
            })
        })
        .collect();

    barrier1.wait();

    // Every connection is claimed, so this fails once the wait window passes
    match pool.get() {
        Ok(_) => unreachable!("pool should be exhausted"),
        Err(e) => warn!(log, "get failed as expected: {}", e),
    }

    barrier2.wait();
    for t in threads {
        let _ = t.join();
    }

    // Give the health sweep and the recovery loop a few cycles
    thread::sleep(Duration::from_secs(2));
    info!(log, "pool stats: {:?}", pool.get_stats());

    let conn = pool.get().expect("recovered connection");
    info!(log, "using connection {}", conn.id);
    pool.put(Some(conn));

    pool.release();
    info!(log, "pool state: {}", pool.get_state());
}
