// Client-message localization
//
// Messages sent to end users are rendered in the language chosen by the
// `lang` query/form field, then the Accept-Language header, falling back
// to English. The catalog covers every stable error code plus the
// session-end notice observers receive.

use jumpgate_session::{ApiError, ErrorCode, Localizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    En,
    Zh,
}

impl Lang {
    /// Pick a language: explicit `lang` value first, then Accept-Language.
    pub fn negotiate(lang_param: Option<&str>, accept_language: Option<&str>) -> Lang {
        if let Some(lang) = lang_param {
            if let Some(found) = Self::parse(lang) {
                return found;
            }
        }
        if let Some(header) = accept_language {
            for part in header.split(',') {
                let tag = part.split(';').next().unwrap_or("").trim();
                if let Some(found) = Self::parse(tag) {
                    return found;
                }
            }
        }
        Lang::En
    }

    fn parse(tag: &str) -> Option<Lang> {
        let tag = tag.to_ascii_lowercase();
        if tag.starts_with("zh") {
            Some(Lang::Zh)
        } else if tag.starts_with("en") {
            Some(Lang::En)
        } else {
            None
        }
    }
}

pub struct CatalogLocalizer {
    lang: Lang,
}

impl CatalogLocalizer {
    pub fn new(lang: Lang) -> Self {
        Self { lang }
    }

    fn detail(err: &ApiError, key: &str) -> String {
        match err.data.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }
}

impl Localizer for CatalogLocalizer {
    fn error_message(&self, err: &ApiError) -> String {
        match self.lang {
            Lang::En => err.fallback_message(),
            Lang::Zh => match err.code {
                ErrorCode::InvalidArgument => {
                    format!("参数错误: {}", Self::detail(err, "err"))
                }
                ErrorCode::NoPermission => {
                    format!("没有权限: {}", Self::detail(err, "perm"))
                }
                ErrorCode::Unauthorized => {
                    format!("未授权: {}", Self::detail(err, "perm"))
                }
                ErrorCode::InvalidSessionId => {
                    format!("无效的会话: {}", Self::detail(err, "sessionId"))
                }
                ErrorCode::WrongPublicKey => "公钥错误".to_string(),
                ErrorCode::HasDependency => {
                    format!("存在依赖: {}", Self::detail(err, "by"))
                }
                ErrorCode::ConnectServer => {
                    format!("连接服务器失败: {}", Self::detail(err, "err"))
                }
                ErrorCode::IdleTimeout => {
                    format!("空闲超时（{}秒），会话已关闭", Self::detail(err, "second"))
                }
                ErrorCode::AccessTime => "当前时间不允许访问".to_string(),
                ErrorCode::AdminClose => {
                    format!("会话已被管理员 {} 关闭", Self::detail(err, "admin"))
                }
                ErrorCode::Internal => {
                    format!("内部错误: {}", Self::detail(err, "err"))
                }
            },
        }
    }

    fn session_end_message(&self, session_id: &str) -> String {
        match self.lang {
            Lang::En => format!("session {} ended", session_id),
            Lang::Zh => format!("会话 {} 已结束", session_id),
        }
    }
}
