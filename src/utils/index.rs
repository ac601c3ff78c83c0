use rand::Rng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent before any call that could
/// panic, so a poisoned lock still holds usable data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Random hex identifier built from `bytes` random bytes.
pub fn random_hex_id(bytes: usize) -> String {
	let mut buf = vec![0u8; bytes];
	rand::rng().fill(&mut buf[..]);
	hex::encode(buf)
}

/// Run a caller-supplied callback, containing any panic it raises.
///
/// Returns `false` if the callback panicked. The panic is logged with `context`.
pub fn invoke_guarded<F: FnOnce()>(context: &str, callback: F) -> bool {
	match catch_unwind(AssertUnwindSafe(callback)) {
		Ok(()) => true,
		Err(panic) => {
			let message = panic
				.downcast_ref::<&str>()
				.map(|s| s.to_string())
				.or_else(|| panic.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "non-string panic payload".to_string());
			error!("Callback for {} panicked: {}", context, message);
			false
		}
	}
}
