//! Protocol adapters: Snapcast, MQTT, KNX, Subsonic.
//!
//! Each adapter owns its connection exclusively. Other components reach an
//! adapter only through its public operations; adapters never hold
//! references into the state store.

pub mod knx;
pub mod mqtt;
pub mod snapcast;
pub mod subsonic;
