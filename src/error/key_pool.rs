use thiserror::Error;

/// 多密钥轮换相关错误
#[derive(Debug, Error)]
pub enum KeyPoolError {
    #[error("渠道 #{channel_id} 没有配置任何密钥")]
    NoKeys { channel_id: i32 },

    #[error("渠道 #{channel_id} 中找不到指定的密钥")]
    KeyNotFound { channel_id: i32 },
}
