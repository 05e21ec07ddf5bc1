use rand::Rng;
use serde::{Deserialize, Serialize};

pub const OTP_SUBJECT: &str = "Account Verification OTP Notification";

/// Payload consumed by the email notification service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EmailNotification {
    pub email: String,
    pub subject: String,
    pub other: String,
    pub body: String,
}

impl EmailNotification {
    pub fn new(email: &str, subject: &str, body: &str) -> Self {
        EmailNotification {
            email: email.to_string(),
            subject: subject.to_string(),
            other: "null".to_string(),
            body: body.to_string(),
        }
    }

    /// The account verification mail carrying `otp`.
    pub fn otp_verification(email: &str, otp: &str) -> Self {
        let body = format!(
            "Your OTP for account verification is: {otp} \n Please enter this OTP on the verification page to complete your account setup. \n If you did not request this OTP, please ignore this message.\n Thank you "
        );
        Self::new(email, OTP_SUBJECT, &body)
    }
}

/// Six digit one-time password.
pub fn generate_otp() -> String {
    rand::rng().random_range(100000..=999999).to_string()
}

/// Request sent to the OCR worker. `file` is the base64 encoded upload.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct OcrRequest {
    pub user_name: String,
    pub user_email: String,
    pub user_id: i64,
    pub file: String,
}

/// Body of an OCR call on the wire: the request nested under `image_data`.
#[derive(Debug, Serialize)]
pub struct OcrCall<'a> {
    pub image_data: &'a OcrRequest,
}

impl<'a> From<&'a OcrRequest> for OcrCall<'a> {
    fn from(image_data: &'a OcrRequest) -> Self {
        OcrCall { image_data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..100 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 6);
            let value: u32 = otp.parse().unwrap();
            assert!((100000..=999999).contains(&value));
        }
    }

    #[test]
    fn otp_notification_wire_format() {
        let notification = EmailNotification::otp_verification("a@b.com", "123456");
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!(json["email"], "a@b.com");
        assert_eq!(json["subject"], OTP_SUBJECT);
        assert_eq!(json["other"], "null");
        assert!(json["body"]
            .as_str()
            .unwrap()
            .starts_with("Your OTP for account verification is: 123456 \n"));
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn ocr_request_field_names() {
        let request = OcrRequest {
            user_name: "Ada".into(),
            user_email: "ada@example.com".into(),
            user_id: 7,
            file: "aGVsbG8=".into(),
        };
        let json = serde_json::to_string(&request).unwrap();

        assert_eq!(
            json,
            r#"{"user_name":"Ada","user_email":"ada@example.com","user_id":7,"file":"aGVsbG8="}"#
        );
    }

    #[test]
    fn ocr_call_nests_request_under_image_data() {
        let request = OcrRequest {
            user_name: "Ada".into(),
            user_email: "ada@example.com".into(),
            user_id: 7,
            file: "aGVsbG8=".into(),
        };
        let json = serde_json::to_string(&OcrCall::from(&request)).unwrap();

        assert_eq!(
            json,
            r#"{"image_data":{"user_name":"Ada","user_email":"ada@example.com","user_id":7,"file":"aGVsbG8="}}"#
        );
    }
}
