use veilnet_core::bencode::{DictBuilder, DictReader, Value};
use veilnet_core::Result;

/// DNS SRV entry a relay may advertise alongside its addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrvRecord {
    /// e.g. `_relay._udp`
    pub service_proto: String,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target name; empty means the advertising relay itself.
    pub target: String,
}

impl SrvRecord {
    pub fn to_value(&self) -> Value {
        DictBuilder::new()
            .insert_int("p", i64::from(self.port))
            .insert_int("r", i64::from(self.priority))
            .insert_bytes("s", self.service_proto.as_bytes().to_vec())
            .insert_bytes("t", self.target.as_bytes().to_vec())
            .insert_int("w", i64::from(self.weight))
            .build()
    }

    pub fn from_value(value: &Value) -> Result<SrvRecord> {
        let dict = DictReader::new(value)?;
        Ok(SrvRecord {
            service_proto: String::from_utf8_lossy(dict.require_bytes("s")?).into_owned(),
            priority: dict.require_int("r")? as u16,
            weight: dict.require_int("w")? as u16,
            port: dict.require_int("p")? as u16,
            target: String::from_utf8_lossy(dict.require_bytes("t")?).into_owned(),
        })
    }
}
