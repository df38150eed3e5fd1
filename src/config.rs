use crate::pacing::Pacer;
use crate::retry::{Backoff, RetryPolicy};
use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

pub static EMAILS_SHEET: Lazy<String> =
    Lazy::new(|| env::var("EMAILS_SHEET").unwrap_or_else(|_| "emails".to_string()));

pub static ORDERS_SHEET: Lazy<String> =
    Lazy::new(|| env::var("ORDERS_SHEET").unwrap_or_else(|_| "orders".to_string()));

pub static PRODUCTS_SHEET: Lazy<String> =
    Lazy::new(|| env::var("PRODUCTS_SHEET").unwrap_or_else(|_| "products".to_string()));

pub static LABEL_ORDER: Lazy<String> =
    Lazy::new(|| env::var("CLASSIFICATION_ORDER").unwrap_or_else(|_| "order request".to_string()));

pub static LABEL_INQUIRY: Lazy<String> = Lazy::new(|| {
    env::var("CLASSIFICATION_INQUIRY").unwrap_or_else(|_| "product inquiry".to_string())
});

pub static LABEL_UNCLASSIFIED: Lazy<String> =
    Lazy::new(|| env::var("CLASSIFICATION_UNKNOWN").unwrap_or_else(|_| "unclassified".to_string()));

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_secs(key: &str, default: f64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .unwrap_or(default);
    Duration::from_secs_f64(secs)
}

fn retry_delay_min() -> Duration {
    env_secs("RETRY_DELAY_MIN", 2.0)
}

fn retry_delay_max() -> Duration {
    env_secs("RETRY_DELAY_MAX", 10.0)
}

/// Stock lookups: full-jitter exponential so parallel runs against the same
/// inventory host spread out.
pub fn stock_check_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: env_u32("STOCK_RETRY_ATTEMPTS", 3),
        backoff: Backoff::FullJitter {
            base: Duration::from_secs(1),
            max: retry_delay_max(),
        },
    }
}

/// Spreadsheet reads/writes: plain capped exponential.
pub fn sheet_write_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: env_u32("SHEETS_RETRY_ATTEMPTS", 3),
        backoff: Backoff::Fixed {
            min: retry_delay_min(),
            max: retry_delay_max(),
        },
    }
}

/// Model inference: plain capped exponential, attempt budget tunable on its own.
pub fn model_inference_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: env_u32("CLASSIFICATION_RETRY_ATTEMPTS", 3),
        backoff: Backoff::Fixed {
            min: retry_delay_min(),
            max: retry_delay_max(),
        },
    }
}

/// Pacing shared by batch drivers: chunk size from BATCH_SIZE, pause from
/// RATE_LIMIT_DELAY.
pub fn batch_pacer() -> Pacer {
    Pacer::new(
        env_usize("BATCH_SIZE", 20),
        env_secs("RATE_LIMIT_DELAY", 1.5),
    )
}

/// Rows per remote append call.
pub fn append_batch_size() -> usize {
    env_usize("APPEND_BATCH_SIZE", 100)
}

/// Orders between throttle pauses in bulk processing.
pub fn bulk_batch_size() -> usize {
    env_usize("BULK_BATCH_SIZE", 5)
}

/// Pause inserted after every bulk chunk.
pub fn bulk_throttle() -> Duration {
    env_secs("BULK_THROTTLE_SECS", 1.0)
}

/// Short breather between individual order items.
pub fn item_pacing() -> Duration {
    Duration::from_millis(
        env::var("ITEM_PACING_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(100),
    )
}
