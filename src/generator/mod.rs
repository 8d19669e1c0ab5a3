//! Synthetic web-access log generator.
//!
//! Simulates a fixed population of users, each with its own address and
//! session id, emitting one request line after a random pause until the
//! configured duration elapses. Output uses the same line format the
//! sources parse, so it can be piped straight into `run`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::seq::index::sample;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{SystemClock, WallClock};
use crate::config::GeneratorConfig;
use crate::event::Event;

/// Largest population with distinct `192.168.0.x` addresses.
pub const MAX_USERS: usize = 256;

const ERROR_PROBABILITY: f64 = 0.03;
const POST_PROBABILITY: f64 = 0.3;
const SUB_PAGE_PROBABILITY: f64 = 0.1;
const DOC_PAGE_PROBABILITY: f64 = 0.1;
const MIN_RESPONSE_TIME_MS: u64 = 1_000;
const MAX_RESPONSE_TIME_MS: u64 = 1_900;

/// One simulated user.
#[derive(Debug, Clone)]
pub struct User {
    pub address: String,
    pub session_id: String,
}

/// Draws `count` users with distinct addresses and fresh session ids.
pub fn users<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Result<Vec<User>> {
    if count > MAX_USERS {
        bail!("at most {MAX_USERS} users are supported, got {count}");
    }

    Ok(sample(rng, MAX_USERS, count)
        .into_iter()
        .map(|host| User {
            address: format!("192.168.0.{host}"),
            session_id: Uuid::new_v4().to_string(),
        })
        .collect())
}

/// Draws one request for `user` at `event_time`.
pub fn random_event<R: Rng + ?Sized>(rng: &mut R, user: &User, event_time: i64) -> Event {
    let response_code = if rng.gen_bool(ERROR_PROBABILITY) {
        404
    } else {
        200
    };

    let method = if rng.gen_bool(POST_PROBABILITY) {
        "POST"
    } else {
        "GET"
    };

    let roll: f64 = rng.gen();
    let path = if roll < SUB_PAGE_PROBABILITY {
        "/sub/page"
    } else if roll < SUB_PAGE_PROBABILITY + DOC_PAGE_PROBABILITY {
        "/doc/page"
    } else {
        "/main/page"
    };

    Event {
        source_address: user.address.clone(),
        event_time,
        method: method.to_string(),
        path: path.to_string(),
        response_code,
        response_time_ms: rng.gen_range(MIN_RESPONSE_TIME_MS..=MAX_RESPONSE_TIME_MS),
        session_id: user.session_id.clone(),
    }
}

fn pause<R: Rng + ?Sized>(rng: &mut R, cfg: &GeneratorConfig) -> Duration {
    if cfg.max_sleep > cfg.min_sleep {
        rng.gen_range(cfg.min_sleep..cfg.max_sleep)
    } else {
        cfg.min_sleep
    }
}

/// Runs every user until `cfg.duration` elapses or `cancel` fires, writing
/// one line per request to `out`. Returns the number of lines written.
pub async fn run<W>(cfg: &GeneratorConfig, mut out: W, cancel: CancellationToken) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let population = users(&mut rand::thread_rng(), cfg.users)?;
    let (tx, mut rx) = mpsc::channel::<String>(cfg.users.max(1) * 4);

    info!(
        users = population.len(),
        duration = ?cfg.duration,
        "starting log generator",
    );

    for user in population {
        let cfg = cfg.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(simulate(user, cfg, tx, cancel));
    }
    drop(tx);

    let mut written = 0u64;
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        out.write_all(line.as_bytes())
            .await
            .context("writing generated line")?;
        written += 1;
    }
    out.flush().await.context("flushing generated lines")?;

    info!(lines = written, "log generator finished");

    Ok(written)
}

async fn simulate(
    user: User,
    cfg: GeneratorConfig,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    debug!(address = %user.address, session_id = %user.session_id, "user started");

    let started = tokio::time::Instant::now();
    let clock = SystemClock;

    while started.elapsed() < cfg.duration {
        let wait = pause(&mut rand::thread_rng(), &cfg);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let event = random_event(&mut rand::thread_rng(), &user, clock.now_millis());
        if tx.send(event.to_line()).await.is_err() {
            break;
        }
    }

    debug!(address = %user.address, "user finished");
}
