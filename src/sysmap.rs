//! SystemMap / ChannelSpec data model (spec §3).
//!
//! Grounded on the teacher's `src/sandbox/mod.rs`: a `bitflags!` capability
//! bitset (there, `LinuxNamespaces`; here, channel access) plus a
//! `Builder`+`Getters` derive pair for a data-only struct.

use bitflags::bitflags;
use derive_builder::Builder;
use getset::{CopyGetters, Getters, MutGetters, Setters};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{collections::HashMap, path::PathBuf};

bitflags! {
    pub struct Access: u32 {
        const READABLE = 0b00001;
        const WRITABLE = 0b00010;
        /// Read-only with random access.
        const CDR      = 0b00100;
        const NETWORK  = 0b01000;
        /// Implies the final etag must be recomputed after sandbox writes.
        const RANDOM   = 0b10000;
    }
}

impl Access {
    pub fn is_response_channel(self) -> bool {
        self.contains(Access::WRITABLE)
    }
}

// bitflags 1.x has no built-in serde support; the wire format is a plain
// integer bitset (spec §3), so (de)serialize through `bits()` by hand.
impl Serialize for Access {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for Access {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Access::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid access bitset {}", bits)))
    }
}

/// A single channel descriptor parsed from the job's `sysmap`.
#[derive(Builder, Clone, Debug, Getters, CopyGetters, MutGetters, Setters, Serialize, Deserialize)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct ChannelSpec {
    #[get = "pub"]
    pub device: String,

    #[get = "pub"]
    #[builder(default)]
    pub path: String,

    #[get_copy = "pub"]
    pub access: Access,

    #[get = "pub"]
    #[builder(default)]
    pub content_type: String,

    // --- derived during staging (spec §3) ---
    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    pub lpath: Option<PathBuf>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    pub size: u64,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    pub meta: HashMap<String, String>,

    /// Byte offset past a CGI preamble, if any.
    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    pub offset: u64,

    /// Raw tar header bytes for this channel's staged member, if it arrived
    /// via the inbound tar (used when re-emitting the member on response).
    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    #[serde(skip)]
    pub info: Vec<u8>,
}

impl ChannelSpec {
    /// `true` when this channel's `content_type` means the sandbox output
    /// begins with HTTP response headers that must be stripped (spec §3/§4.9).
    pub fn is_cgi(&self) -> bool {
        self.content_type.starts_with("message/http") || self.content_type.starts_with("message/cgi")
    }

    /// `true` when this is a response channel: WRITABLE with no backing URL.
    pub fn is_pure_response(&self) -> bool {
        self.access.contains(Access::WRITABLE) && self.path.is_empty()
    }
}

/// The parsed job description for this node (spec §3). Free-form fields not
/// named explicitly are preserved verbatim in `extra` so they round-trip
/// into the response `sysmap`.
#[derive(Builder, Clone, Debug, Getters, CopyGetters, MutGetters, Serialize, Deserialize)]
#[builder(pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "kebab-case")]
pub struct SystemMap {
    #[get = "pub"]
    pub name: String,

    #[get = "pub"]
    pub exe: String,

    #[getset(get = "pub", get_mut = "pub")]
    pub channels: Vec<ChannelSpec>,

    #[get_copy = "pub"]
    #[builder(default = "1")]
    pub replicate: u32,

    #[get = "pub"]
    #[builder(default)]
    pub replicas: Vec<String>,

    #[get = "pub"]
    #[serde(flatten)]
    #[builder(default)]
    pub extra: HashMap<String, Value>,
}

impl SystemMap {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The image component of `exe`, if `exe` is an `image://name/path` URL.
    pub fn exe_image(&self) -> Option<&str> {
        self.exe.strip_prefix("image://").and_then(|rest| rest.split('/').next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(device: &str, access: Access) -> ChannelSpec {
        ChannelSpecBuilder::default()
            .device(device)
            .access(access)
            .build()
            .unwrap()
    }

    #[test]
    fn access_bitset_combines() {
        let a = Access::READABLE | Access::CDR;
        assert!(a.contains(Access::READABLE));
        assert!(a.contains(Access::CDR));
        assert!(!a.contains(Access::WRITABLE));
    }

    #[test]
    fn cgi_detection_by_content_type_prefix() {
        let mut c = channel("stdout", Access::WRITABLE);
        c.content_type = "message/http".to_string();
        assert!(c.is_cgi());
        c.content_type = "message/cgi; extra".to_string();
        assert!(c.is_cgi());
        c.content_type = "text/plain".to_string();
        assert!(!c.is_cgi());
    }

    #[test]
    fn pure_response_channel_has_no_url() {
        let c = channel("stdout", Access::WRITABLE);
        assert!(c.is_pure_response());

        let mut c2 = channel("data", Access::WRITABLE);
        c2.path = "swift://a/c/o".to_string();
        assert!(!c2.is_pure_response());
    }

    #[test]
    fn sysmap_round_trips_through_json_preserving_extra_fields() {
        let json = br#"{
            "name": "job1",
            "exe": "swift://a/c/boot",
            "channels": [
                {"device": "stdin", "path": "", "access": 1, "content_type": ""},
                {"device": "stdout", "path": "", "access": 2, "content_type": "text/plain"}
            ],
            "replicate": 2,
            "replicas": ["node-1"],
            "x-custom-field": "kept"
        }"#;
        let map = SystemMap::from_json(json).unwrap();
        assert_eq!(map.name(), "job1");
        assert_eq!(map.channels().len(), 2);
        assert_eq!(map.replicate(), 2);
        assert_eq!(
            map.extra().get("x-custom-field").unwrap().as_str(),
            Some("kept")
        );

        let reserialized = map.to_json().unwrap();
        let roundtrip = SystemMap::from_json(&reserialized).unwrap();
        assert_eq!(roundtrip.name(), "job1");
        assert_eq!(
            roundtrip.extra().get("x-custom-field").unwrap().as_str(),
            Some("kept")
        );
    }

    #[test]
    fn exe_image_parses_image_url() {
        let map = SystemMapBuilder::default()
            .name("job")
            .exe("image://python/usr/bin/boot")
            .channels(vec![])
            .build()
            .unwrap();
        assert_eq!(map.exe_image(), Some("python"));
    }
}
