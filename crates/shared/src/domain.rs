use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub $inner);
    };
}

id_newtype!(RecipientId, i64);
id_newtype!(GroupId, i64);
id_newtype!(DeviceId, u32);
id_newtype!(RegistrationId, u32);
id_newtype!(PreKeyId, u32);

pub const PRIMARY_DEVICE_ID: DeviceId = DeviceId(1);

/// Prekey ids live in a 24-bit space shared with the server.
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFF;

/// Registration ids are 14-bit values.
pub const MAX_REGISTRATION_ID: u32 = 16380;

impl PreKeyId {
    pub fn next(self) -> Self {
        if self.0 >= MAX_PREKEY_ID {
            Self(1)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for PreKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two identity namespaces an account owns keys in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceIdKind {
    Aci,
    Pni,
}

impl ServiceIdKind {
    pub const ALL: [ServiceIdKind; 2] = [ServiceIdKind::Aci, ServiceIdKind::Pni];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aci => "aci",
            Self::Pni => "pni",
        }
    }
}

impl fmt::Display for ServiceIdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aci(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pni(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "uuid", rename_all = "snake_case")]
pub enum ServiceId {
    Aci(Aci),
    Pni(Pni),
}

impl ServiceId {
    pub fn kind(&self) -> ServiceIdKind {
        match self {
            Self::Aci(_) => ServiceIdKind::Aci,
            Self::Pni(_) => ServiceIdKind::Pni,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Aci(aci) => aci.0,
            Self::Pni(pni) => pni.0,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aci(aci) => write!(f, "{}", aci.0),
            Self::Pni(pni) => write!(f, "PNI:{}", pni.0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("phone number must be in E.164 form, got '{0}'")]
    InvalidE164(String),
}

/// Phone number in E.164 form (`+` followed by 8 to 15 digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct E164(String);

impl E164 {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        let Some(digits) = trimmed.strip_prefix('+') else {
            return Err(DomainError::InvalidE164(raw.to_string()));
        };
        if !(8..=15).contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::InvalidE164(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for E164 {
    type Error = DomainError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<E164> for String {
    fn from(number: E164) -> Self {
        number.0
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey(pub [u8; 32]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneNumberDiscoverability {
    #[default]
    Undecided,
    Discoverable,
    NotDiscoverable,
}
