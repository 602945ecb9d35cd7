use chrono::prelude::*;
use easy_ext::ext;

#[ext(DateTimeExt)]
pub(crate) impl DateTime<Utc> {
    fn to_human_readable(self) -> String {
        self.format("%Y-%m-%d %H:%M UTC").to_string()
    }

    /// Relative description of the moment, e.g. `5 minutes ago`
    fn to_human_ago(self, now: DateTime<Utc>) -> String {
        timeago::Formatter::new().convert_chrono(self, now)
    }
}
