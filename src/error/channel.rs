use thiserror::Error;

/// 渠道选择与渠道状态相关错误
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("渠道不存在: #{0}")]
    NotFound(i32),

    #[error("分组 {group} 下模型 {model} 无可用渠道")]
    NoAvailableChannel { group: String, model: String },

    #[error("已尝试所有自动分组, 模型 {model} 无可用渠道")]
    AutoGroupsExhausted { model: String },

    #[error("数据一致性已被破坏, 渠道 #{0} 不存在, 请联系管理员")]
    DataInconsistency(i32),

    #[error("渠道选择失败: 加权随机未命中任何渠道")]
    SelectionMissed,

    #[error("能力重建正在进行中")]
    RebuildInProgress,
}

impl ChannelError {
    /// 是否属于"没有可用渠道"一类的正常耗尽
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableChannel { .. } | Self::AutoGroupsExhausted { .. }
        )
    }
}
