//! # 令牌校验
//!
//! 按密钥查找令牌并检查状态、有效期与额度。过期与耗尽在首次被发现时
//! 写回数据库, 之后直接按缓存的状态拒绝。

use std::net::IpAddr;
use std::sync::Arc;

use entity::tokens::{self, TokenStatus};
use ipnetwork::IpNetwork;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveEnum, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::cache::{CacheKeyBuilder, UnifiedCacheManager};
use crate::error::{Result, TokenError};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

/// 令牌服务
pub struct TokenService {
    db: Arc<DatabaseConnection>,
    cache: Option<Arc<UnifiedCacheManager>>,
}

impl TokenService {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>, cache: Option<Arc<UnifiedCacheManager>>) -> Self {
        Self { db, cache }
    }

    /// 校验令牌并返回其快照
    pub async fn validate_user_token(&self, raw_key: &str) -> Result<tokens::Model> {
        let key = normalize_key(raw_key);
        if key.is_empty() {
            return Err(TokenError::NotFound.into());
        }

        let mut token = self.find_token(key).await?.ok_or(TokenError::NotFound)?;
        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => return Err(TokenError::Disabled.into()),
            TokenStatus::Expired => return Err(TokenError::Expired.into()),
            TokenStatus::Exhausted => return Err(TokenError::Exhausted.into()),
        }

        let now = chrono::Utc::now().timestamp();
        if token.is_expired_at(now) {
            self.persist_status(&token, TokenStatus::Expired).await?;
            return Err(TokenError::Expired.into());
        }

        if let Some(remain) = self.mirrored_remain(key).await {
            token.remain_quota = remain;
        }
        if token.is_exhausted() {
            self.persist_status(&token, TokenStatus::Exhausted).await?;
            return Err(TokenError::Exhausted.into());
        }

        Ok(token)
    }

    /// 模型白名单检查
    pub fn check_model_allowed(token: &tokens::Model, model: &str) -> Result<()> {
        if !token.model_limits_enabled {
            return Ok(());
        }
        if token.model_limit_list().iter().any(|m| m == model) {
            Ok(())
        } else {
            Err(TokenError::ModelNotAllowed {
                model: model.to_string(),
            }
            .into())
        }
    }

    /// 来源 IP 检查, 支持单个地址与 CIDR
    pub fn check_ip_allowed(token: &tokens::Model, ip: IpAddr) -> Result<()> {
        let rules: Vec<&str> = token
            .allow_ips
            .as_deref()
            .unwrap_or_default()
            .split(['\n', ','])
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect();
        if rules.is_empty() {
            return Ok(());
        }

        let allowed = rules.iter().any(|rule| match rule.parse::<IpNetwork>() {
            Ok(network) => network.contains(ip),
            Err(_) => {
                lwarn!(
                    "system",
                    LogStage::Internal,
                    LogComponent::Token,
                    "invalid_ip_rule",
                    "无法解析的 IP 白名单规则",
                    token_id = token.id,
                    rule = *rule
                );
                false
            }
        });

        if allowed {
            Ok(())
        } else {
            Err(TokenError::IpNotAllowed { ip: ip.to_string() }.into())
        }
    }

    /// 丢弃令牌的缓存快照与额度镜像
    pub async fn invalidate(&self, raw_key: &str) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let key = normalize_key(raw_key);
        cache.delete(&CacheKeyBuilder::token_snapshot(key).build()).await?;
        cache.delete(&CacheKeyBuilder::token_quota(key).build()).await?;
        Ok(())
    }

    async fn find_token(&self, key: &str) -> Result<Option<tokens::Model>> {
        if let Some(cache) = &self.cache {
            let snapshot_key = CacheKeyBuilder::token_snapshot(key).build();
            match cache.get::<tokens::Model>(&snapshot_key).await {
                Ok(Some(token)) => return Ok(Some(token)),
                Ok(None) => {}
                Err(err) => lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Token,
                    "snapshot_read_failed",
                    "令牌快照读取失败, 回退到数据库",
                    error = %err
                ),
            }
        }

        let token = tokens::Entity::find()
            .filter(tokens::Column::Key.eq(key))
            .one(self.db.as_ref())
            .await?;

        if let (Some(cache), Some(token)) = (&self.cache, &token) {
            let ttl = Some(cache.default_ttl());
            let snapshot = cache
                .set(&CacheKeyBuilder::token_snapshot(key).build(), token, ttl)
                .await;
            let quota = cache
                .set(&CacheKeyBuilder::token_quota(key).build(), token.remain_quota, ttl)
                .await;
            if let Err(err) = snapshot.and(quota) {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Token,
                    "snapshot_write_failed",
                    "令牌快照写入失败",
                    token_id = token.id,
                    error = %err
                );
            } else {
                ldebug!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Token,
                    "snapshot_cached",
                    "令牌快照已缓存",
                    token_id = token.id
                );
            }
        }
        Ok(token)
    }

    async fn mirrored_remain(&self, key: &str) -> Option<i64> {
        let cache = self.cache.as_ref()?;
        cache
            .get::<i64>(&CacheKeyBuilder::token_quota(key).build())
            .await
            .ok()
            .flatten()
    }

    async fn persist_status(&self, token: &tokens::Model, status: TokenStatus) -> Result<()> {
        tokens::Entity::update_many()
            .col_expr(tokens::Column::Status, Expr::value(status.to_value()))
            .filter(tokens::Column::Id.eq(token.id))
            .filter(tokens::Column::Status.eq(TokenStatus::Enabled))
            .exec(self.db.as_ref())
            .await?;
        self.invalidate(&token.key).await?;

        linfo!(
            "system",
            LogStage::Billing,
            LogComponent::Token,
            "token_status_persisted",
            "令牌状态已更新",
            token_id = token.id,
            status = %status.to_value()
        );
        Ok(())
    }
}

fn normalize_key(raw: &str) -> &str {
    let key = raw.trim();
    let key = key.strip_prefix("Bearer ").unwrap_or(key).trim();
    key.strip_prefix("sk-").unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TokenFixture, UserFixture, create_test_db};
    use sea_orm::ActiveModelTrait;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key(" sk-abc "), "abc");
        assert_eq!(normalize_key("Bearer sk-abc"), "abc");
        assert_eq!(normalize_key("abc"), "abc");
    }

    #[test]
    fn test_model_limits() {
        let token = TokenFixture::new().model_limits("gpt-4o, claude-3").to_model_with_id(1, 1);
        assert!(TokenService::check_model_allowed(&token, "claude-3").is_ok());
        assert!(TokenService::check_model_allowed(&token, "o1").is_err());

        let open = TokenFixture::new().to_model_with_id(2, 1);
        assert!(TokenService::check_model_allowed(&open, "o1").is_ok());
    }

    #[test]
    fn test_ip_allow_list() {
        let token = TokenFixture::new()
            .allow_ips("10.0.0.0/8\n192.168.1.7")
            .to_model_with_id(1, 1);
        assert!(TokenService::check_ip_allowed(&token, "10.2.3.4".parse().unwrap()).is_ok());
        assert!(TokenService::check_ip_allowed(&token, "192.168.1.7".parse().unwrap()).is_ok());
        assert!(TokenService::check_ip_allowed(&token, "192.168.1.8".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_expired_token_is_persisted() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let token = TokenFixture::new()
            .user_id(user.id)
            .expired_time(1)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let service = TokenService::new(Arc::clone(&db), None);
        let err = service.validate_user_token(&token.key).await.unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::Token(TokenError::Expired)));

        let row = tokens::Entity::find_by_id(token.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(row.status, TokenStatus::Expired);
    }

    #[tokio::test]
    async fn test_exhausted_limited_token() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let token = TokenFixture::new()
            .user_id(user.id)
            .remain_quota(0)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let service = TokenService::new(Arc::clone(&db), None);
        let err = service.validate_user_token(&format!("sk-{}", token.key)).await.unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::Token(TokenError::Exhausted)));
    }
}
