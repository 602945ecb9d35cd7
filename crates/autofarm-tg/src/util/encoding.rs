use crate::prelude::*;
use serde::Serialize;

pub(crate) fn to_yaml_string<T: Serialize + ?Sized>(data: &T) -> String {
    serde_yaml::to_string(data).unwrap_or_else(|err| {
        error!(
            err = tracing_err(&err),
            ty = std::any::type_name::<T>(),
            "Failed to serialize data to YAML"
        );
        format!("{{serialization error: {err}}}")
    })
}
