/*!
This crate provides `ProgressCounter`, a cheap atomic counter used to report the progress of work that is spread across a thread pool, such as training the trees of a forest. Clones share the same underlying counter, so one clone can be handed to each worker while the caller polls another.
*/

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

#[derive(Clone, Debug)]
pub struct ProgressCounter {
	current: Arc<AtomicU64>,
	total: u64,
}

impl ProgressCounter {
	/// Create a counter that counts from 0 up to `total`.
	pub fn new(total: u64) -> ProgressCounter {
		ProgressCounter {
			current: Arc::new(AtomicU64::new(0)),
			total,
		}
	}

	/// The value this counter counts up to.
	pub fn total(&self) -> u64 {
		self.total
	}

	/// The current value of the counter.
	pub fn get(&self) -> u64 {
		self.current.load(Ordering::Relaxed)
	}

	/// Add `amount` to the counter.
	pub fn inc(&self, amount: u64) {
		self.current.fetch_add(amount, Ordering::Relaxed);
	}

	/// The current value as a fraction of the total, for display.
	pub fn fraction(&self) -> f64 {
		if self.total == 0 {
			1.0
		} else {
			self.get() as f64 / self.total as f64
		}
	}
}
