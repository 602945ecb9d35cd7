use async_trait::async_trait;
use easy_ext::ext;
use futures::prelude::*;
use std::time::Duration;

#[ext(FutureExt)]
#[async_trait]
pub(crate) impl<F> F
where
    F: Future + Send,
{
    async fn with_duration(self) -> (F::Output, Duration) {
        let start = std::time::Instant::now();
        let result = self.await;
        (result, start.elapsed())
    }
}
