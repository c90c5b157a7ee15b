// Error budget for the poll loop
//
// Transient registry or adapter errors should not bring the service down, but
// a steady stream of them should.

use crate::errors::SchedulerError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub struct SpuriousErrorPolicy {
    kinds: Vec<String>,
    max_errors: usize,
    span: Duration,
    errors: usize,
    window_start: Instant,
}

impl SpuriousErrorPolicy {
    /// Absorb up to `max_errors` errors of the given kinds within `span`
    pub fn new(kinds: Vec<String>, max_errors: usize, span: Duration) -> Self {
        Self {
            kinds,
            max_errors,
            span,
            errors: 0,
            window_start: Instant::now(),
        }
    }

    /// `Ok` when the error is absorbed; the error itself when the loop should stop
    pub fn absorb(&mut self, err: SchedulerError) -> Result<(), SchedulerError> {
        if !self.kinds.iter().any(|kind| kind == err.kind()) {
            return Err(err);
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) > self.span {
            self.window_start = now;
            self.errors = 0;
        }

        self.errors += 1;
        if self.errors > self.max_errors {
            warn!(
                errors = self.errors,
                max_errors = self.max_errors,
                span_seconds = self.span.as_secs(),
                "Error budget exhausted"
            );
            return Err(err);
        }

        Ok(())
    }

    /// Errors counted in the current span
    pub fn errors(&self) -> usize {
        self.errors
    }
}
