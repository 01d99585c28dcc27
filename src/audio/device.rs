//! Audio device enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Description of a host audio device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    /// Whether the device can open a mono stream
    pub supports_mono: bool,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }
}

/// List capture and render devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let supports_mono = device
                    .supported_input_configs()
                    .map(|mut configs| configs.any(|c| c.channels() == 1))
                    .unwrap_or(false);
                devices.push(DeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    supports_mono,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let supports_mono = device
                    .supported_output_configs()
                    .map(|mut configs| configs.any(|c| c.channels() == 1))
                    .unwrap_or(false);
                devices.push(DeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    supports_mono,
                });
            }
        }
    }

    devices
}

/// Get a device by its ID
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = match parse_device_id(id) {
        Some(parsed) => parsed,
        None => return Err(AudioError::DeviceNotFound(id.to_string())),
    };

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(AudioDevice::from_cpal(device));
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Split `input:<name>` / `output:<name>`; a bare name is an input
fn parse_device_id(id: &str) -> Option<(bool, &str)> {
    if let Some(name) = id.strip_prefix("input:") {
        Some((true, name))
    } else if let Some(name) = id.strip_prefix("output:") {
        Some((false, name))
    } else if id.is_empty() {
        None
    } else {
        Some((true, id))
    }
}

/// Get default input device
pub fn get_default_input_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_input_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Get default output device
pub fn get_default_output_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_output_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("input:Mic"), Some((true, "Mic")));
        assert_eq!(parse_device_id("output:Speakers"), Some((false, "Speakers")));
        assert_eq!(parse_device_id("USB Mic"), Some((true, "USB Mic")));
        assert_eq!(parse_device_id(""), None);
    }
}
