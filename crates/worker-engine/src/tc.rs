//! Time-control parsing and CPU scaling.
//!
//! Controls come in cutechess format, `[moves/]seconds[:seconds][+inc]`.
//! Scaling multiplies the base time and increment by the machine's CPU
//! factor and re-formats to the 3 decimal places both the match runner
//! and monty parse. The derived wall-clock limit bounds how long one
//! match invocation may run.

use tracing::info;

use montytest_worker_core::error::{Result, WorkerError};

#[derive(Debug, Clone, PartialEq)]
pub struct TimeControl {
    /// Moves per control, 0 when the whole game runs on one budget.
    pub moves: u64,
    pub seconds: f64,
    pub increment: f64,
}

pub fn parse_tc(tc: &str) -> Result<TimeControl> {
    let bad = || WorkerError::run(format!("unable to parse time control {tc}"));

    let mut parts = tc.split('+');
    let main = parts.next().ok_or_else(bad)?;
    let increment = match parts.next() {
        Some(raw) => raw.parse::<f64>().map_err(|_| bad())?,
        None => 0.0,
    };
    if parts.next().is_some() {
        return Err(bad());
    }

    let chunks: Vec<&str> = main.split('/').collect();
    let (moves, time) = match chunks.as_slice() {
        [time] => (0, *time),
        [moves, time] => ((*moves).parse::<u64>().map_err(|_| bad())?, *time),
        _ => return Err(bad()),
    };

    let clock: Vec<&str> = time.split(':').collect();
    let seconds = match clock.as_slice() {
        [secs] => secs.parse::<f64>().map_err(|_| bad())?,
        [mins, secs] => {
            mins.parse::<f64>().map_err(|_| bad())? * 60.0
                + secs.parse::<f64>().map_err(|_| bad())?
        }
        _ => return Err(bad()),
    };

    Ok(TimeControl {
        moves,
        seconds,
        increment,
    })
}

/// Scale `tc` by the CPU factor. Returns the re-formatted control and
/// the wall-clock limit (seconds) for one match at that control.
pub fn adjust_tc(tc: &str, factor: f64) -> Result<(String, f64)> {
    let parsed = parse_tc(tc)?;
    let seconds = parsed.seconds * factor;
    let increment = parsed.increment * factor;

    let mut scaled = format!("{seconds:.3}");
    let mut limit = seconds * 3.0;
    if parsed.increment > 0.0 {
        scaled.push_str(&format!("+{increment:.3}"));
        limit += increment * 200.0;
    }
    if parsed.moves > 0 {
        scaled = format!("{}/{scaled}", parsed.moves);
        limit *= 100.0 / parsed.moves as f64;
    }

    info!("cpu factor: {factor} - tc adjusted to {scaled}");
    Ok((scaled, limit))
}
