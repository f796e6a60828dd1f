//! 数据模型

pub mod connection_profile;

pub use connection_profile::{
    AuthConfig, AuthType, ConnectionProfile, ProfileError, RemoteConfig, DEFAULT_SSH_PORT,
};
