//! 连接配置模型
//!
//! 远程连接的模板（Profile）与运行时配置（RemoteConfig）。
//!
//! ## 说明
//! - `ConnectionProfile` 是外部持久化的扁平结构，字段按 `auth_type` 可选
//! - `AuthConfig` 是带标签的联合类型，非法组合无法表示
//! - `RemoteConfig` 是经过校验的运行时配置，会话只消费它

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 默认 SSH 端口
pub const DEFAULT_SSH_PORT: u16 = 22;

/// 配置校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    /// 缺少必填字段
    #[error("缺少必填字段: {0}")]
    MissingField(&'static str),
}

/// 认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    Password,
    PrivateKey,
}

impl Default for AuthType {
    fn default() -> Self {
        Self::Password
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password => write!(f, "password"),
            Self::PrivateKey => write!(f, "privateKey"),
        }
    }
}

/// 认证配置
///
/// 密码与私钥二选一，由类型保证。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "authType", rename_all = "camelCase")]
pub enum AuthConfig {
    /// 密码认证
    #[serde(rename_all = "camelCase")]
    Password { password: String },
    /// 私钥认证（可选密钥密码）
    #[serde(rename_all = "camelCase")]
    PrivateKey {
        private_key_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl AuthConfig {
    /// 对应的认证方式
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::Password { .. } => AuthType::Password,
            Self::PrivateKey { .. } => AuthType::PrivateKey,
        }
    }

    /// 配置的密码（键盘交互认证时用于自动应答）
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Password { password } => Some(password.as_str()),
            Self::PrivateKey { .. } => None,
        }
    }

    /// 检查凭据是否齐全
    pub fn validate(&self) -> Result<(), ProfileError> {
        match self {
            Self::Password { password } if password.is_empty() => {
                Err(ProfileError::MissingField("password"))
            }
            Self::PrivateKey {
                private_key_path, ..
            } if private_key_path.as_os_str().is_empty() => {
                Err(ProfileError::MissingField("privateKeyPath"))
            }
            _ => Ok(()),
        }
    }
}

// 凭据不进入日志
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"***")
                .finish(),
            Self::PrivateKey {
                private_key_path,
                passphrase,
            } => f
                .debug_struct("PrivateKey")
                .field("private_key_path", private_key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// 远程连接运行时配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(flatten)]
    pub auth: AuthConfig,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl RemoteConfig {
    /// 创建并校验配置
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthConfig,
    ) -> Result<Self, ProfileError> {
        let config = Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验主机、用户名和凭据
    ///
    /// 在任何网络动作之前调用。
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.host.trim().is_empty() {
            return Err(ProfileError::MissingField("host"));
        }
        if self.username.trim().is_empty() {
            return Err(ProfileError::MissingField("username"));
        }
        self.auth.validate()
    }

    /// `host:port` 形式的地址
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `user@host:port` 形式的显示名
    pub fn display_name(&self) -> String {
        format!("{}@{}", self.username, self.address())
    }
}

/// 持久化的连接配置（外部存储，按 id 索引）
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .field("private_key_path", &self.private_key_path)
            .finish_non_exhaustive()
    }
}

impl ConnectionProfile {
    /// 有效端口（未指定时为 22）
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// 按 `auth_type` 取出对应字段，转换为运行时配置
    ///
    /// 空字符串视为缺失。
    pub fn to_remote_config(&self) -> Result<RemoteConfig, ProfileError> {
        let auth = match self.auth_type {
            AuthType::Password => AuthConfig::Password {
                password: non_empty(&self.password)
                    .ok_or(ProfileError::MissingField("password"))?
                    .to_string(),
            },
            AuthType::PrivateKey => AuthConfig::PrivateKey {
                private_key_path: PathBuf::from(
                    non_empty(&self.private_key_path)
                        .ok_or(ProfileError::MissingField("privateKeyPath"))?,
                ),
                passphrase: non_empty(&self.passphrase).map(str::to_string),
            },
        };

        RemoteConfig::new(
            self.host.trim(),
            self.effective_port(),
            self.username.trim(),
            auth,
        )
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_profile(password: Option<&str>) -> ConnectionProfile {
        ConnectionProfile {
            id: "p1".to_string(),
            name: "prod".to_string(),
            host: "10.0.0.5".to_string(),
            port: None,
            username: "root".to_string(),
            auth_type: AuthType::Password,
            password: password.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_password_profile_converts() {
        let config = password_profile(Some("secret")).to_remote_config().unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.auth.auth_type(), AuthType::Password);
        assert_eq!(config.auth.password(), Some("secret"));
        assert_eq!(config.display_name(), "root@10.0.0.5:22");
    }

    #[test]
    fn test_empty_password_rejected() {
        assert_eq!(
            password_profile(Some("")).to_remote_config(),
            Err(ProfileError::MissingField("password"))
        );
        assert_eq!(
            password_profile(None).to_remote_config(),
            Err(ProfileError::MissingField("password"))
        );
    }

    #[test]
    fn test_empty_key_path_rejected() {
        let profile = ConnectionProfile {
            auth_type: AuthType::PrivateKey,
            private_key_path: Some(String::new()),
            ..password_profile(Some("ignored"))
        };
        assert_eq!(
            profile.to_remote_config(),
            Err(ProfileError::MissingField("privateKeyPath"))
        );
    }

    #[test]
    fn test_private_key_profile_keeps_passphrase() {
        let profile = ConnectionProfile {
            auth_type: AuthType::PrivateKey,
            private_key_path: Some("~/.ssh/id_ed25519".to_string()),
            passphrase: Some("pp".to_string()),
            port: Some(2222),
            ..password_profile(None)
        };
        let config = profile.to_remote_config().unwrap();
        assert_eq!(config.port, 2222);
        match config.auth {
            AuthConfig::PrivateKey {
                private_key_path,
                passphrase,
            } => {
                assert_eq!(private_key_path, PathBuf::from("~/.ssh/id_ed25519"));
                assert_eq!(passphrase.as_deref(), Some("pp"));
            }
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_missing_host_or_username() {
        let auth = AuthConfig::Password {
            password: "x".to_string(),
        };
        assert_eq!(
            RemoteConfig::new(" ", 22, "root", auth.clone()),
            Err(ProfileError::MissingField("host"))
        );
        assert_eq!(
            RemoteConfig::new("host", 22, "", auth),
            Err(ProfileError::MissingField("username"))
        );
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let config = RemoteConfig::new(
            "::1",
            2200,
            "me",
            AuthConfig::Password {
                password: "x".to_string(),
            },
        )
        .unwrap();
        assert_eq!(config.address(), "[::1]:2200");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let auth = AuthConfig::PrivateKey {
            private_key_path: PathBuf::from("/k"),
            passphrase: Some("hunter2".to_string()),
        };
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("hunter2"));

        let profile = password_profile(Some("hunter2"));
        assert!(!format!("{:?}", profile).contains("hunter2"));
    }

    #[test]
    fn test_remote_config_json_shape() {
        let json = r#"{"host":"h","username":"u","authType":"privateKey","privateKeyPath":"/k"}"#;
        let config: RemoteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.auth.auth_type(), AuthType::PrivateKey);

        let json = r#"{"host":"h","port":2022,"username":"u","authType":"password","password":"p"}"#;
        let config: RemoteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 2022);
        assert_eq!(config.auth.password(), Some("p"));
    }
}
