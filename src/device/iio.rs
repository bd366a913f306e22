//! Network IIO backend.
//!
//! Talks to the cape's IIO daemon through libiio (`ip:<host>` context).
//! Every device gets a context of its own, so a probe moved onto its
//! capture worker never shares a connection with another worker.

use super::{Device, DeviceContext};
use crate::error::{CaptureError, DeviceError};
use industrial_io::{Buffer, Channel, Context};
use std::any::TypeId;
use tracing::{debug, info, warn};

fn context_uri(host: &str) -> String {
    format!("ip:{}", host)
}

/// IIO context of a networked ACME cape.
pub struct IioContext {
    host: String,
    device_count: usize,
}

impl IioContext {
    /// Connect to the IIO daemon of `host`.
    pub fn connect(host: &str) -> Result<Self, CaptureError> {
        info!("Connecting to {}...", host);
        let uri = context_uri(host);
        let context = Context::from_uri(&uri)
            .map_err(|e| CaptureError::BackendUnavailable(format!("{}: {}", uri, e)))?;
        let device_count = context.num_devices();
        debug!("IIO context {} holds {} device(s)", uri, device_count);

        Ok(Self {
            host: host.to_string(),
            device_count,
        })
    }

    fn open_device(&self, index: usize) -> Result<IioDevice, String> {
        let context = Context::from_uri(&context_uri(&self.host)).map_err(|e| e.to_string())?;
        let device = context.get_device(index).map_err(|e| e.to_string())?;
        let id = device.id().unwrap_or_else(|| format!("iio:device{}", index));
        let name = device.name().unwrap_or_default();
        Ok(IioDevice {
            id,
            name,
            device,
            buffer: None,
        })
    }
}

impl DeviceContext for IioContext {
    fn description(&self) -> String {
        format!("IIO context {}", context_uri(&self.host))
    }

    fn into_devices(self: Box<Self>) -> Vec<Box<dyn Device>> {
        let mut devices: Vec<Box<dyn Device>> = Vec::with_capacity(self.device_count);
        for index in 0..self.device_count {
            match self.open_device(index) {
                Ok(device) => devices.push(Box::new(device)),
                Err(e) => warn!("Failed to open IIO device {}: {}", index, e),
            }
        }
        devices
    }
}

/// One IIO device with its own connection.
pub struct IioDevice {
    id: String,
    name: String,
    device: industrial_io::Device,
    buffer: Option<Buffer>,
}

// SAFETY: an IioDevice owns its libiio context outright; no handle into
// that context exists outside this value, so moving it to another thread
// cannot introduce concurrent access.
unsafe impl Send for IioDevice {}

impl IioDevice {
    fn channel(&self, channel_id: &str) -> Result<Channel, DeviceError> {
        self.device
            .find_channel(channel_id, false)
            .ok_or_else(|| DeviceError::ChannelNotFound(channel_id.to_string()))
    }
}

impl Device for IioDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_attr(&self, attr: &str) -> Result<String, DeviceError> {
        self.device
            .attr_read_str(attr)
            .map_err(|_| DeviceError::AttributeNotFound(attr.to_string()))
    }

    fn write_attr(&mut self, attr: &str, value: &str) -> Result<(), DeviceError> {
        self.device
            .attr_write_str(attr, value)
            .map_err(|e| DeviceError::WriteFailed {
                attr: attr.to_string(),
                message: e.to_string(),
            })
    }

    fn has_channel(&self, channel_id: &str) -> bool {
        self.device.find_channel(channel_id, false).is_some()
    }

    fn set_channel_enabled(&mut self, channel_id: &str, enabled: bool) -> Result<(), DeviceError> {
        let channel = self.channel(channel_id)?;
        if enabled {
            channel.enable();
        } else {
            channel.disable();
        }
        Ok(())
    }

    fn read_channel_attr(&self, channel_id: &str, attr: &str) -> Result<String, DeviceError> {
        self.channel(channel_id)?
            .attr_read_str(attr)
            .map_err(|_| DeviceError::AttributeNotFound(attr.to_string()))
    }

    fn create_buffer(&mut self, samples: usize, cyclic: bool) -> Result<(), DeviceError> {
        self.buffer = None;
        let buffer = self
            .device
            .create_buffer(samples, cyclic)
            .map_err(|e| DeviceError::BufferAllocation(e.to_string()))?;
        self.buffer = Some(buffer);
        Ok(())
    }

    fn refill_buffer(&mut self) -> Result<(), DeviceError> {
        let buffer = self.buffer.as_mut().ok_or(DeviceError::NoBuffer)?;
        buffer
            .refill()
            .map(|_| ())
            .map_err(|e| DeviceError::Refill(e.to_string()))
    }

    fn read_channel_raw(&self, channel_id: &str) -> Result<Vec<u8>, DeviceError> {
        let buffer = self.buffer.as_ref().ok_or(DeviceError::NoBuffer)?;
        let channel = self.channel(channel_id)?;
        if !channel.is_enabled() {
            return Err(DeviceError::ChannelDisabled(channel_id.to_string()));
        }

        // Samples are 16 bits wide; unsigned ones are reinterpreted as i16.
        let io_error = |e: industrial_io::Error| DeviceError::Io(e.to_string());
        let values: Vec<i16> = if channel.type_of() == Some(TypeId::of::<u16>()) {
            channel
                .read::<u16>(buffer)
                .map_err(io_error)?
                .into_iter()
                .map(|v| v as i16)
                .collect()
        } else {
            channel.read::<i16>(buffer).map_err(io_error)?
        };

        Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    fn destroy_buffer(&mut self) {
        if self.buffer.take().is_some() {
            debug!(device = %self.id, "IIO buffer destroyed");
        }
    }
}
