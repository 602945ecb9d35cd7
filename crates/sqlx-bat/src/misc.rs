use easy_ext::ext;

#[ext(ErrorExt)]
pub impl sqlx::Error {
    /// Returns `true` if the error was caused by the violation of the constraint
    /// with the given name.
    fn is_constraint_violation(&self, constraint: &str) -> bool {
        self.as_database_error()
            .map(|err| err.constraint() == Some(constraint))
            .unwrap_or(false)
    }
}
