use std::fmt;

use veilnet_core::bencode::Value;
use veilnet_core::{Result, VeilnetError};

/// Software version triple a relay advertises in its contact.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RouterVersion(pub [u16; 3]);

impl RouterVersion {
    pub fn to_value(&self) -> Value {
        Value::List(self.0.iter().map(|v| Value::Int(i64::from(*v))).collect())
    }

    pub fn from_value(value: &Value) -> Result<RouterVersion> {
        let list = value
            .as_list()
            .ok_or_else(|| VeilnetError::InvalidMessage("router version is not a list".into()))?;
        if list.len() != 3 {
            return Err(VeilnetError::InvalidMessage(format!(
                "router version has {} parts instead of 3",
                list.len()
            )));
        }
        let mut parts = [0u16; 3];
        for (slot, item) in parts.iter_mut().zip(list) {
            let n = item
                .as_int()
                .ok_or_else(|| VeilnetError::InvalidMessage("version part not an int".into()))?;
            *slot = u16::try_from(n)
                .map_err(|_| VeilnetError::InvalidMessage("version part out of range".into()))?;
        }
        Ok(RouterVersion(parts))
    }
}

impl fmt::Display for RouterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Debug for RouterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterVersion({self})")
    }
}
