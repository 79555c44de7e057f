pub mod groups;
pub mod kv;
mod memory;
pub mod protocol;
pub mod recipients;
mod sqlite;
pub mod values;

use locks::TransactionProbe;

pub use groups::{GroupRecord, GroupStore};
pub use kv::{KeyValueExt, KeyValueStore};
pub use memory::{MemoryStore, TransactionGuard};
pub use protocol::{
    IdentityKeyPair, KyberPreKeyRecord, ProtocolStore, SessionAddress, SessionRecord,
    SignedKeyRecord,
};
pub use recipients::{RecipientRecord, RecipientStore, RegisteredState};
pub use sqlite::{SqliteStore, SqliteTransaction};
pub use values::{
    AccountValues, PhoneNumberPrivacyValues, PreKeyMetadata, ProfileValues, RegistrationValues,
    SvrValues,
};

/// Everything the coordination core reads and writes, behind one handle.
pub trait DataStore: TransactionProbe + Send + Sync {
    fn key_values(&self) -> &dyn KeyValueStore;
    fn protocol(&self) -> &dyn ProtocolStore;
    fn recipients(&self) -> &dyn RecipientStore;
    fn groups(&self) -> &dyn GroupStore;

    fn account(&self) -> AccountValues<'_> {
        AccountValues::new(self.key_values())
    }

    fn registration(&self) -> RegistrationValues<'_> {
        RegistrationValues::new(self.key_values())
    }

    fn profile(&self) -> ProfileValues<'_> {
        ProfileValues::new(self.key_values())
    }

    fn svr(&self) -> SvrValues<'_> {
        SvrValues::new(self.key_values())
    }

    fn phone_number_privacy(&self) -> PhoneNumberPrivacyValues<'_> {
        PhoneNumberPrivacyValues::new(self.key_values())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
