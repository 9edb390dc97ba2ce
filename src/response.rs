//! 统一的 JSON 响应信封 `{success, message, data?}`。

use axum::response::Json as JsonResponse;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub(crate) success: bool,
    pub(crate) message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// 成功响应，附带数据。
    pub fn ok(message: impl Into<String>, data: T) -> JsonResponse<Self> {
        JsonResponse(Self {
            success: true,
            message: message.into(),
            data: Some(data),
        })
    }
}

impl ApiResponse<()> {
    /// 成功响应，不带数据。
    pub fn done(message: impl Into<String>) -> JsonResponse<Self> {
        JsonResponse(Self {
            success: true,
            message: message.into(),
            data: None,
        })
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_is_omitted_when_absent() {
        let JsonResponse(body) = ApiResponse::done("File deleted successfully");
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"success": true, "message": "File deleted successfully"})
        );
    }

    #[test]
    fn data_is_nested_under_data_key() {
        let JsonResponse(body) = ApiResponse::ok("ok", vec!["a.txt"]);
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["data"], serde_json::json!(["a.txt"]));
        assert_eq!(value["success"], serde_json::json!(true));
    }
}
