//! Associated device records and their storage.

pub mod store;

pub use store::{
    default_device_store_path, AssociatedDevice, DeviceStorage, JsonDeviceStore, StorageError,
};
