use crate::error::fatal;
use crate::Result;
use futures::prelude::*;
use std::collections::HashSet;

macro_rules! def_constraints {
    ($($ident:ident)*) => {
        $(
            // The variable name will have the same casing convention as the constraint name.
            #[allow(non_upper_case_globals, dead_code)]
            pub(crate) const $ident: &str = stringify!($ident);
        )*
        const ALL_CONSTRAINTS: &[&str] = &[$($ident),*];
    }
}

def_constraints! {
    users_pk
    ad_slots_pk
    ad_slots_user_fk
    ad_slots_user_slot_number_uq
    ad_slots_interval_positive_ck
    destinations_pk
    destinations_slot_fk
    destinations_slot_chat_uq
    workers_pk
    worker_cooldowns_pk
    worker_cooldowns_worker_fk
    worker_bans_pk
    worker_bans_worker_fk
    posting_history_pk
    posting_history_slot_fk
    posting_history_destination_fk
    payments_pk
    payments_user_fk
    payments_tx_hash_uq
}

/// Validates that our constraint names in code are fresh
pub(crate) async fn validate(pool: sqlx::PgPool) -> Result {
    Constraints::new(pool).validate().await
}

struct Constraints {
    pool: sqlx::PgPool,
}

impl Constraints {
    fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn validate(&self) -> Result {
        let actual_constraints = self.fetch_all().await?;

        let non_existing_constraints: Vec<_> = ALL_CONSTRAINTS
            .iter()
            .filter(|&&constraint| !actual_constraints.contains(constraint))
            .collect();

        if non_existing_constraints.is_empty() {
            return Ok(());
        }

        Err(fatal!(
            "Constraints {non_existing_constraints:?} are not defined in migrations. \
            Actual constraints: {actual_constraints:?}"
        ))
    }

    async fn fetch_all(&self) -> Result<HashSet<String>> {
        let query = sqlx::query_scalar::<_, String>(
            "select conname::text
            from pg_catalog.pg_constraint
            inner join pg_catalog.pg_namespace nsp
            on nsp.oid = connamespace and nsp.nspname = 'public'",
        );

        query.fetch(&self.pool).try_collect().err_into().await
    }
}
