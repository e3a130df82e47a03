pub const DEFAULT_BASE_PORT: u16 = 5000;
pub const DEFAULT_BLOCK_SIZE: u16 = 100;

/// Port for worker `worker_index` of the service registered at
/// `service_index`. Each service owns the block
/// `[base + service_index * block_size, base + (service_index + 1) * block_size)`.
///
/// Computed in `u64` and saturating, so huge indices give a huge port rather
/// than wrapping; callers check the result fits a TCP port.
pub fn allocate(
	base_port: u16,
	block_size: u16,
	service_index: usize,
	worker_index: usize,
) -> u64 {
	(service_index as u64)
		.saturating_mul(block_size as u64)
		.saturating_add(base_port as u64)
		.saturating_add(worker_index as u64)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	#[test]
	fn blocks_per_service() {
		assert_eq!(allocate(5000, 100, 0, 0), 5000);
		assert_eq!(allocate(5000, 100, 1, 0), 5100);
		assert_eq!(allocate(5000, 100, 2, 0), 5200);
		assert_eq!(allocate(3000, 100, 1, 1), 3101);
	}

	#[test]
	fn no_collisions_below_block_size() {
		let mut seen = HashSet::new();
		for service in 0..5 {
			for worker in 0..99 {
				assert!(seen.insert(allocate(5000, 100, service, worker)));
			}
		}
		assert_eq!(seen.len(), 5 * 99);
	}

	#[test]
	fn wide_arithmetic() {
		assert_eq!(allocate(u16::MAX, 100, 10, 5), 65535 + 1005);
		assert_eq!(allocate(5000, 100, usize::MAX, 0), u64::MAX);
		assert!(allocate(0, 1, 1 << 40, 0) > u32::MAX as u64);
	}
}
