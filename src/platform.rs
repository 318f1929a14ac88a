//! Platform hooks that differ between ESP32 and host builds.

/// Free heap in bytes, where the platform exposes it.
#[cfg(feature = "esp32")]
pub fn free_heap() -> Option<u32> {
    // SAFETY: read-only query of the heap allocator
    Some(unsafe { esp_idf_sys::esp_get_free_heap_size() })
}

/// Free heap in bytes, where the platform exposes it.
#[cfg(not(feature = "esp32"))]
pub fn free_heap() -> Option<u32> {
    None
}

/// Log the free heap after a teardown.
pub fn log_free_heap(context: &str) {
    match free_heap() {
        Some(bytes) => log::info!("Free heap after {}: {} bytes", context, bytes),
        None => log::debug!("Free heap after {}: not available on this platform", context),
    }
}

/// Reboot the chip. Never returns.
#[cfg(feature = "esp32")]
pub fn restart() -> ! {
    log::warn!("Restarting...");
    // SAFETY: esp_restart does not return
    unsafe { esp_idf_sys::esp_restart() };
    #[allow(unreachable_code)]
    loop {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "esp32"))]
    #[test]
    fn test_host_has_no_heap_figure() {
        assert_eq!(free_heap(), None);
        log_free_heap("test");
    }
}
