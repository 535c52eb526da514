use crate::config::SyncOptions;
use crate::error::FieldError;
use serde_json::Value;

type Getter = fn(&SyncOptions) -> Option<&str>;

/// 必填项及缺失时的提示
const REQUIRED: &[(&str, &str, Getter)] = &[
    (
        "reference",
        "Define a firebase URL to upload data to.",
        reference,
    ),
    (
        "token",
        "Define a token used to authenticate against the firebase reference.",
        token,
    ),
];

fn reference(options: &SyncOptions) -> Option<&str> {
    options.reference.as_deref()
}

fn token(options: &SyncOptions) -> Option<&str> {
    options.token.as_deref()
}

/// 内联数据合并到远程根节点，只接受对象
pub fn check_inline_data(data: Option<&Value>) -> Option<FieldError> {
    match data {
        None | Some(Value::Null) | Some(Value::Object(_)) => None,
        Some(_) => Some(FieldError {
            field: "data",
            message: "Define data as an object to merge into the firebase reference.",
        }),
    }
}

/// 校验必填配置，一次性返回所有问题（空白字符串视为缺失）
pub fn validate_options(options: &SyncOptions) -> Result<(), Vec<FieldError>> {
    let mut errors: Vec<FieldError> = REQUIRED
        .iter()
        .filter(|(_, _, get)| get(options).map(|v| v.trim().is_empty()).unwrap_or(true))
        .map(|&(field, message, _)| FieldError { field, message })
        .collect();
    errors.extend(check_inline_data(options.data.as_ref()));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
