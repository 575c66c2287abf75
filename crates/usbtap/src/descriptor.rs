//! Descriptor mirror: a verbatim snapshot of the peripheral's descriptor
//! tree, taken once at startup and immutable afterwards.
//!
//! The raw bytes are what the host gets back from GET_DESCRIPTOR, byte for
//! byte (save for the bMaxPacketSize0 floor); the parsed tree drives endpoint
//! bring-up.

use std::collections::HashMap;

use crate::error::DescriptorError;
use crate::usb::{self, EndpointKind};

/// Raw descriptor material fetched from the peripheral.
#[derive(Debug, Clone, Default)]
pub struct RawDescriptors {
    /// 18-byte device descriptor, exactly as the device returned it.
    pub device: Vec<u8>,
    /// Full configuration descriptors (wTotalLength bytes each), in index
    /// order.
    pub configs: Vec<Vec<u8>>,
    /// Pre-fetched string descriptors, keyed by string index.
    pub strings: HashMap<u8, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn kind(&self) -> EndpointKind {
        EndpointKind::from_attributes(self.attributes)
    }

    pub fn direction(&self) -> crate::usb::Direction {
        crate::usb::Direction::of_endpoint(self.address)
    }

    /// The 9-byte `usb_endpoint_descriptor` layout raw-gadget expects for
    /// ep_enable (audio fields zeroed for non-audio endpoints).
    pub fn to_gadget_bytes(&self) -> [u8; 9] {
        let mps = self.max_packet_size.to_le_bytes();
        [
            7,
            usb::USB_DT_ENDPOINT,
            self.address,
            self.attributes,
            mps[0],
            mps[1],
            self.interval,
            0,
            0,
        ]
    }
}

/// One (interface number, alternate setting) with its endpoint set.
#[derive(Debug, Clone)]
pub struct InterfaceAlt {
    pub number: u8,
    pub alt: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    /// bConfigurationValue, what SET_CONFIGURATION selects by.
    pub value: u8,
    /// Verbatim descriptor bytes, served to the host untouched.
    raw: Vec<u8>,
    pub interfaces: Vec<InterfaceAlt>,
}

impl ConfigDescriptor {
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Interface numbers present in this configuration, deduplicated and in
    /// first-appearance order.
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for alt in &self.interfaces {
            if !out.contains(&alt.number) {
                out.push(alt.number);
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct DescriptorMirror {
    device: Vec<u8>,
    configs: Vec<ConfigDescriptor>,
    strings: HashMap<u8, Vec<u8>>,
}

impl DescriptorMirror {
    /// Build the mirror from raw bytes. `mps0_floor` is applied to the stored
    /// device descriptor: byte 7 becomes `max(original, floor)`.
    pub fn build(raw: RawDescriptors, mps0_floor: u8) -> Result<Self, DescriptorError> {
        if raw.device.len() < 18 {
            return Err(DescriptorError::TruncatedDevice {
                len: raw.device.len(),
            });
        }
        let mut device = raw.device;
        if device[7] < mps0_floor {
            tracing::info!(
                original = device[7],
                floor = mps0_floor,
                "raising bMaxPacketSize0 for the gadget controller"
            );
            device[7] = mps0_floor;
        }

        let mut configs = Vec::with_capacity(raw.configs.len());
        for (index, bytes) in raw.configs.into_iter().enumerate() {
            configs.push(parse_config(index, bytes)?);
        }

        Ok(Self {
            device,
            configs,
            strings: raw.strings,
        })
    }

    /// Verbatim device descriptor bytes (bMaxPacketSize0 already floored).
    pub fn device_descriptor_bytes(&self) -> &[u8] {
        &self.device
    }

    pub fn vendor_id(&self) -> u16 {
        u16::from_le_bytes([self.device[8], self.device[9]])
    }

    pub fn product_id(&self) -> u16 {
        u16::from_le_bytes([self.device[10], self.device[11]])
    }

    pub fn max_packet_size0(&self) -> u8 {
        self.device[7]
    }

    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    pub fn config_descriptor_bytes(&self, index: usize) -> Option<&[u8]> {
        self.configs.get(index).map(|c| c.raw_bytes())
    }

    pub fn find_config_by_value(&self, value: u8) -> Option<usize> {
        self.configs.iter().position(|c| c.value == value)
    }

    pub fn config_by_value(&self, value: u8) -> Option<&ConfigDescriptor> {
        self.configs.iter().find(|c| c.value == value)
    }

    /// Endpoints of one (configuration value, interface, alternate setting).
    pub fn endpoints(&self, config_value: u8, interface: u8, alt: u8) -> Option<&[EndpointDescriptor]> {
        self.config_by_value(config_value)?
            .interfaces
            .iter()
            .find(|ia| ia.number == interface && ia.alt == alt)
            .map(|ia| ia.endpoints.as_slice())
    }

    pub fn string_descriptor(&self, index: u8) -> Option<&[u8]> {
        self.strings.get(&index).map(|s| s.as_slice())
    }
}

fn parse_config(index: usize, bytes: Vec<u8>) -> Result<ConfigDescriptor, DescriptorError> {
    let malformed = |reason| DescriptorError::MalformedConfig { index, reason };

    if bytes.len() < 9 || bytes[1] != usb::USB_DT_CONFIG {
        return Err(malformed("missing configuration header"));
    }
    let value = bytes[5];

    let mut interfaces: Vec<InterfaceAlt> = Vec::new();
    let mut offset = bytes[0] as usize;
    while offset < bytes.len() {
        if offset + 2 > bytes.len() {
            return Err(malformed("trailing descriptor fragment"));
        }
        let len = bytes[offset] as usize;
        let dtype = bytes[offset + 1];
        if len < 2 || offset + len > bytes.len() {
            return Err(malformed("descriptor length out of bounds"));
        }
        let body = &bytes[offset..offset + len];

        match dtype {
            usb::USB_DT_INTERFACE => {
                if len < 9 {
                    return Err(malformed("short interface descriptor"));
                }
                interfaces.push(InterfaceAlt {
                    number: body[2],
                    alt: body[3],
                    endpoints: Vec::new(),
                });
            }
            usb::USB_DT_ENDPOINT => {
                if len < 7 {
                    return Err(malformed("short endpoint descriptor"));
                }
                let current = interfaces
                    .last_mut()
                    .ok_or(malformed("endpoint before any interface"))?;
                let ep = EndpointDescriptor {
                    address: body[2],
                    attributes: body[3],
                    max_packet_size: u16::from_le_bytes([body[4], body[5]]),
                    interval: body[6],
                };
                if current.endpoints.iter().any(|e| e.address == ep.address) {
                    return Err(DescriptorError::DuplicateEndpoint {
                        address: ep.address,
                        interface: current.number,
                        alt: current.alt,
                    });
                }
                current.endpoints.push(ep);
            }
            // Class- and vendor-specific descriptors ride along untouched in
            // the raw bytes; the tree does not need them.
            _ => {}
        }
        offset += len;
    }

    Ok(ConfigDescriptor {
        value,
        raw: bytes,
        interfaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_device_bytes(mps0: u8) -> Vec<u8> {
        vec![
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, mps0, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01,
            0x01, 0x02, 0x03, 0x01,
        ]
    }

    /// Config 1: interface 0 alt 0 (EP 0x81 interrupt) and alt 1
    /// (EP 0x82 bulk in, EP 0x02 bulk out).
    fn sample_config_bytes() -> Vec<u8> {
        let mut cfg = vec![
            0x09, 0x02, 0x00, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // config header
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00, // iface 0 alt 0
            0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x0a, // EP 0x81 int, mps 64
            0x09, 0x04, 0x00, 0x01, 0x02, 0xff, 0x00, 0x00, 0x00, // iface 0 alt 1
            0x07, 0x05, 0x82, 0x02, 0x00, 0x02, 0x00, // EP 0x82 bulk, mps 512
            0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00, // EP 0x02 bulk, mps 512
        ];
        let total = (cfg.len() as u16).to_le_bytes();
        cfg[2] = total[0];
        cfg[3] = total[1];
        cfg
    }

    fn sample_raw(mps0: u8) -> RawDescriptors {
        RawDescriptors {
            device: sample_device_bytes(mps0),
            configs: vec![sample_config_bytes()],
            strings: HashMap::from([(2, vec![0x06, 0x03, b'T', 0x00, b'P', 0x00])]),
        }
    }

    #[test]
    fn device_bytes_served_verbatim_with_floor() {
        let mirror = DescriptorMirror::build(sample_raw(0x40), 64).unwrap();
        assert_eq!(mirror.device_descriptor_bytes(), &sample_device_bytes(0x40)[..]);

        let mirror = DescriptorMirror::build(sample_raw(0x08), 64).unwrap();
        let mut expected = sample_device_bytes(0x08);
        expected[7] = 64;
        assert_eq!(mirror.device_descriptor_bytes(), &expected[..]);
        assert_eq!(mirror.max_packet_size0(), 64);
        assert_eq!(mirror.vendor_id(), 0x1234);
        assert_eq!(mirror.product_id(), 0x5678);
    }

    #[test]
    fn config_bytes_are_untouched() {
        let mirror = DescriptorMirror::build(sample_raw(0x40), 64).unwrap();
        assert_eq!(
            mirror.config_descriptor_bytes(0).unwrap(),
            &sample_config_bytes()[..]
        );
        assert_eq!(mirror.config_descriptor_bytes(1), None);
    }

    #[test]
    fn endpoint_tree_lookup() {
        let mirror = DescriptorMirror::build(sample_raw(0x40), 64).unwrap();
        assert_eq!(mirror.find_config_by_value(1), Some(0));
        assert_eq!(mirror.find_config_by_value(2), None);

        let alt0 = mirror.endpoints(1, 0, 0).unwrap();
        assert_eq!(alt0.len(), 1);
        assert_eq!(alt0[0].address, 0x81);
        assert_eq!(alt0[0].kind(), EndpointKind::Interrupt);
        assert_eq!(alt0[0].max_packet_size, 64);

        let alt1 = mirror.endpoints(1, 0, 1).unwrap();
        let addrs: Vec<u8> = alt1.iter().map(|e| e.address).collect();
        assert_eq!(addrs, vec![0x82, 0x02]);
        assert_eq!(mirror.endpoints(1, 0, 2), None);

        let config = mirror.config_by_value(1).unwrap();
        assert_eq!(config.interface_numbers(), vec![0]);
    }

    #[test]
    fn gadget_bytes_layout() {
        let ep = EndpointDescriptor {
            address: 0x82,
            attributes: 0x02,
            max_packet_size: 512,
            interval: 0,
        };
        assert_eq!(
            ep.to_gadget_bytes(),
            [7, 0x05, 0x82, 0x02, 0x00, 0x02, 0x00, 0, 0]
        );
    }

    #[test]
    fn build_is_idempotent_on_identical_input() {
        let a = DescriptorMirror::build(sample_raw(0x08), 64).unwrap();
        let b = DescriptorMirror::build(sample_raw(0x08), 64).unwrap();
        assert_eq!(a.device_descriptor_bytes(), b.device_descriptor_bytes());
        assert_eq!(
            a.config_descriptor_bytes(0).unwrap(),
            b.config_descriptor_bytes(0).unwrap()
        );
    }

    #[test]
    fn duplicate_endpoint_rejected() {
        let mut cfg = sample_config_bytes();
        // Rewrite EP 0x02 to collide with 0x82 within alt 1.
        let pos = cfg.len() - 5;
        cfg[pos] = 0x82;
        let raw = RawDescriptors {
            device: sample_device_bytes(0x40),
            configs: vec![cfg],
            strings: HashMap::new(),
        };
        match DescriptorMirror::build(raw, 64) {
            Err(DescriptorError::DuplicateEndpoint { address: 0x82, .. }) => {}
            other => panic!("expected duplicate endpoint error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_device_rejected() {
        let raw = RawDescriptors {
            device: vec![0x12, 0x01],
            configs: vec![],
            strings: HashMap::new(),
        };
        assert!(matches!(
            DescriptorMirror::build(raw, 64),
            Err(DescriptorError::TruncatedDevice { len: 2 })
        ));
    }

    #[test]
    fn string_snapshot_lookup() {
        let mirror = DescriptorMirror::build(sample_raw(0x40), 64).unwrap();
        assert!(mirror.string_descriptor(2).is_some());
        assert_eq!(mirror.string_descriptor(9), None);
    }
}
