type DynError = dyn std::error::Error + Send + Sync + 'static;
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors of conversion between the app and db representations of values
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "Failed to serialize app value into db repr.\n\
        App type: {app_ty}\n\
        Db type: {db_ty}\n\
        App value: {app_val}"
    )]
    Serialize {
        source: Box<DynError>,
        app_ty: &'static str,
        db_ty: &'static str,
        app_val: String,
    },

    #[error(
        "Failed to deserialize db value into app repr.\n\
        App type: {app_ty}\n\
        Db type: {db_ty}\n\
        Db value: {db_val}"
    )]
    Deserialize {
        source: Box<DynError>,
        app_ty: &'static str,
        db_ty: &'static str,
        db_val: String,
    },
}
