mod owned_join_handle;
pub use owned_join_handle::OwnedJoinHandle;
