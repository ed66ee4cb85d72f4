//! Vulkan logical device shared by the backend.
//!
//! The host application creates the instance, picks the physical device and
//! creates the logical device (windowing is outside this crate). [`Device`]
//! takes ownership of the logical device, loads the extension function
//! tables the backend needs and initializes gpu-allocator.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::RhiResult;

/// Handles the host passes in when building a [`Device`].
pub struct DeviceDesc<'a> {
    pub instance: &'a ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue_family: u32,
    /// Queue used for both graphics submission and presentation.
    pub graphics_queue: vk::Queue,
    /// Load `VK_EXT_debug_utils` labels. The instance extension must be enabled.
    pub debug_labels: bool,
}

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// Shared across encoding threads through `Arc`. The allocator and the
/// graphics queue are each protected by a mutex.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    /// Dropped before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    graphics_queue: Mutex<vk::Queue>,
    graphics_queue_family: u32,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl Device {
    /// Wraps a host-created logical device.
    ///
    /// # Errors
    ///
    /// Returns an error if allocator initialization fails.
    pub fn new(desc: DeviceDesc<'_>) -> RhiResult<Arc<Self>> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: desc.instance.clone(),
            device: desc.device.clone(),
            physical_device: desc.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        info!("GPU memory allocator initialized");

        let swapchain_loader = ash::khr::swapchain::Device::new(desc.instance, &desc.device);
        let debug_utils = desc
            .debug_labels
            .then(|| ash::ext::debug_utils::Device::new(desc.instance, &desc.device));

        Ok(Arc::new(Self {
            device: desc.device,
            physical_device: desc.physical_device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue: Mutex::new(desc.graphics_queue),
            graphics_queue_family: desc.graphics_queue_family,
            swapchain_loader,
            debug_utils,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Returns the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    #[inline]
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Debug-utils functions, when labels were requested.
    #[inline]
    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.debug_utils.as_ref()
    }

    /// Waits for the device to become idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Submits to the graphics queue.
    ///
    /// # Safety
    ///
    /// The command buffers must be fully recorded and the fence unsignaled.
    pub unsafe fn submit_graphics(
        &self,
        submit_infos: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let queue = self.graphics_queue.lock();
        unsafe {
            self.device.queue_submit(*queue, submit_infos, fence)?;
        }
        Ok(())
    }

    /// Presents `image_index` of `swapchain`.
    ///
    /// Returns `true` when the swapchain is suboptimal.
    ///
    /// # Safety
    ///
    /// The swapchain and semaphores must be valid.
    pub unsafe fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let waits = [wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let queue = self.graphics_queue.lock();
        unsafe { self.swapchain_loader.queue_present(*queue, &present_info) }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: ash::Device is Send + Sync, the queue and allocator are behind
// mutexes and the remaining fields are plain handles.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }
}
