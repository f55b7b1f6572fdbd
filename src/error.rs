//
// Error generator macro
//
use std::error::Error as StdError;
use std::fmt;

macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $error:expr, $show_cause:expr ),+ $(,)? ) => {
        #[derive(Debug)]
        enum ErrorKind { $( $name($ty) ),+ }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error {
                    error: $error,
                    message: err.to_string(),
                    code: status_for($error),
                    www_authenticate: None,
                    kind: ErrorKind::$name(err),
                }
            }
        })+

        impl Error {
            // First value goes to the log, the OAuth pair goes on the wire
            pub fn log(&self) {
                match &self.kind {$(
                    ErrorKind::$name(e) => {
                        error!("{}: {}", self.error, self.message);
                        if $show_cause {
                            error!("[CAUSE] {e:?}");
                        }
                    }
                )+}
            }
        }
    };
}

// Each variant wraps the underlying failure for logging; the `error` and
// `message` fields are what RFC 6749 §5.2 calls `error` and
// `error_description` and are the only parts a client ever sees.
make_error! {
    Simple(String):                        "invalid_request", false,
    Serde(serde_json::Error):              "server_error",    true,
    OpenSsl(openssl::error::ErrorStack):   "server_error",    true,
    Reqwest(reqwest::Error):               "server_error",    true,
    UrlParse(url::ParseError):             "invalid_request", true,
}

#[derive(Debug)]
pub struct Error {
    error: &'static str,
    message: String,
    code: u16,
    www_authenticate: Option<String>,
    kind: ErrorKind,
}

// Default HTTP status per OAuth error code (RFC 6749 §5.2, RFC 6750 §3.1)
fn status_for(error: &str) -> u16 {
    match error {
        "invalid_client" | "invalid_token" => 401,
        "insufficient_scope" => 403,
        "server_error" => 500,
        "temporarily_unavailable" => 503,
        _ => 400,
    }
}

impl Error {
    pub fn new<M: Into<String>>(error: &'static str, message: M) -> Self {
        let message = message.into();
        Error {
            error,
            code: status_for(error),
            www_authenticate: None,
            kind: ErrorKind::Simple(message.clone()),
            message,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    pub fn with_www_authenticate<S: Into<String>>(mut self, challenge: S) -> Self {
        self.www_authenticate = Some(challenge.into());
        self
    }

    pub fn error(&self) -> &'static str {
        self.error
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> u16 {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl StdError for Error {}

//
// Rocket responder impl
//
use std::io::Cursor;

use rocket::http::{ContentType, Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde_json::json;

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        self.log();

        // Internal failures keep their detail in the log; the wire only gets
        // a correlation id to quote when reporting the problem.
        let description = if self.code >= 500 {
            let correlation_id = uuid::Uuid::new_v4();
            error!("{} [correlation_id={correlation_id}]: {}", self.error, self.message);
            format!("Internal error (reference {correlation_id})")
        } else {
            self.message.clone()
        };

        let body = json!({
            "error": self.error,
            "error_description": description,
        })
        .to_string();

        let mut builder = Response::build();
        builder
            .status(Status::new(self.code))
            .header(ContentType::JSON)
            .raw_header("Cache-Control", "no-store")
            .raw_header("Pragma", "no-cache")
            .sized_body(body.len(), Cursor::new(body));

        if let Some(challenge) = self.www_authenticate {
            builder.header(Header::new("WWW-Authenticate", challenge));
        }

        builder.ok()
    }
}

///
/// Error return macros
///
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        return Err($crate::error::Error::new("invalid_request", $msg));
    }};
    ($error:expr, $msg:expr) => {{
        return Err($crate::error::Error::new($error, $msg));
    }};
}

#[macro_export]
macro_rules! err_code {
    ($error:expr, $msg:expr, $code:expr) => {{
        return Err($crate::error::Error::new($error, $msg).with_code($code));
    }};
}
