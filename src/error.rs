use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unauthorized"))]
    Unauthorized,

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Duplicate id: {id}"))]
    DuplicateId { id: String },

    #[snafu(display("Invalid status: {value}"))]
    InvalidStatus { value: String },

    #[snafu(display("Invalid table: {name}"))]
    InvalidTable { name: String },

    #[snafu(display("Reset of {name} is not allowed"))]
    ProtectedTable { name: String },

    #[snafu(display("Invalid header {header}: {message}"))]
    InvalidHeader { header: String, message: String },

    #[snafu(display("Invalid callback url: {message}"))]
    InvalidUrl { message: String },

    #[snafu(display("Invalid body: {message}"))]
    InvalidBody { message: String },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Outbound request failed"))]
    Http {
        #[snafu(source)]
        source: reqwest::Error,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        Self::Http { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: format!("message {}", id.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::Unauthorized => actix_web::http::StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::DuplicateId { .. } => actix_web::http::StatusCode::CONFLICT,

            Self::InvalidStatus { .. }
            | Self::InvalidTable { .. }
            | Self::ProtectedTable { .. }
            | Self::InvalidHeader { .. }
            | Self::InvalidUrl { .. }
            | Self::InvalidBody { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::InternalServerError { .. }
            | Self::Sqlx { .. }
            | Self::MigrationError { .. }
            | Self::Http { .. } => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "message": self.to_string() }))
    }
}
