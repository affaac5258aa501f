//! Database query functions for the `claims` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Claim, ClaimFilter, ClaimPatch, ClaimRow, Claimant, NewClaim};

const SELECT_COLUMNS: &str = "id, issue_id, source, source_ref, title, description, status, \
     claimant_type, claimant_user_id, claimant_name, claimant_agent_id, claimant_agent_type, \
     progress, context, metadata, created_at, updated_at";

/// Insert a new claim row. Returns the inserted claim with server-generated
/// defaults (id, status=backlog, progress=0, timestamps).
pub async fn insert_claim(pool: &PgPool, data: &NewClaim) -> Result<Claim> {
    let row = sqlx::query_as::<_, ClaimRow>(&format!(
        "INSERT INTO claims (issue_id, source, source_ref, title, description, context, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {SELECT_COLUMNS}"
    ))
    .bind(&data.issue_id)
    .bind(data.source)
    .bind(&data.source_ref)
    .bind(&data.title)
    .bind(&data.description)
    .bind(&data.context)
    .bind(&data.metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert claim")?;

    Ok(row.into_claim())
}

/// Fetch a claim by its internal id.
pub async fn get_claim(pool: &PgPool, id: Uuid) -> Result<Option<Claim>> {
    let row = sqlx::query_as::<_, ClaimRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM claims WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch claim")?;

    Ok(row.map(ClaimRow::into_claim))
}

/// Fetch a claim by its external-facing issue id.
pub async fn get_claim_by_issue_id(pool: &PgPool, issue_id: &str) -> Result<Option<Claim>> {
    let row = sqlx::query_as::<_, ClaimRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM claims WHERE issue_id = $1"
    ))
    .bind(issue_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch claim by issue id")?;

    Ok(row.map(ClaimRow::into_claim))
}

/// List claims matching `filter`. An empty filter returns every claim,
/// newest first.
pub async fn list_claims(pool: &PgPool, filter: &ClaimFilter) -> Result<Vec<Claim>> {
    // Built with positional binds rather than a query builder crate, matching
    // the plain string-concatenation style used elsewhere in this crate.
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if !filter.status.is_empty() {
        let placeholders: Vec<String> = filter
            .status
            .iter()
            .enumerate()
            .map(|(i, _)| format!("${}", binds.len() + i + 1))
            .collect();
        clauses.push(format!("status IN ({})", placeholders.join(", ")));
        binds.extend(filter.status.iter().map(|s| s.to_string()));
    }
    if let Some(source) = filter.source {
        binds.push(source.to_string());
        clauses.push(format!("source = ${}", binds.len()));
    }
    if let Some(ref claimant_type) = filter.claimant_type {
        binds.push(claimant_type.clone());
        clauses.push(format!("claimant_type = ${}", binds.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM claims{where_clause} ORDER BY created_at DESC"
    );

    let mut query = sqlx::query_as::<_, ClaimRow>(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .context("failed to list claims")?;

    Ok(rows.into_iter().map(ClaimRow::into_claim).collect())
}

/// Apply a partial update to a claim, by internal id. Returns `None` if the
/// claim does not exist.
pub async fn patch_claim(
    pool: &PgPool,
    id: Uuid,
    patch: &ClaimPatch,
) -> Result<Option<Claim>> {
    let mut sets: Vec<String> = vec!["updated_at = now()".to_string()];
    let mut binds: Vec<Option<String>> = Vec::new();

    if let Some(status) = patch.status {
        binds.push(Some(status.to_string()));
        sets.push(format!("status = ${}", binds.len()));
    }
    if let Some(progress) = patch.progress {
        binds.push(Some(progress.to_string()));
        sets.push(format!("progress = ${}::int", binds.len()));
    }
    if let Some(ref claimant) = patch.claimant {
        match claimant {
            Some(Claimant::Human { user_id, name }) => {
                binds.push(Some("human".to_string()));
                sets.push(format!("claimant_type = ${}", binds.len()));
                binds.push(Some(user_id.clone()));
                sets.push(format!("claimant_user_id = ${}", binds.len()));
                binds.push(Some(name.clone()));
                sets.push(format!("claimant_name = ${}", binds.len()));
                sets.push("claimant_agent_id = NULL".to_string());
                sets.push("claimant_agent_type = NULL".to_string());
            }
            Some(Claimant::Agent {
                agent_id,
                agent_type,
            }) => {
                binds.push(Some("agent".to_string()));
                sets.push(format!("claimant_type = ${}", binds.len()));
                binds.push(Some(agent_id.clone()));
                sets.push(format!("claimant_agent_id = ${}", binds.len()));
                binds.push(Some(agent_type.clone()));
                sets.push(format!("claimant_agent_type = ${}", binds.len()));
                sets.push("claimant_user_id = NULL".to_string());
                sets.push("claimant_name = NULL".to_string());
            }
            None => {
                sets.push("claimant_type = NULL".to_string());
                sets.push("claimant_user_id = NULL".to_string());
                sets.push("claimant_name = NULL".to_string());
                sets.push("claimant_agent_id = NULL".to_string());
                sets.push("claimant_agent_type = NULL".to_string());
            }
        }
    }
    if let Some(ref context) = patch.context {
        binds.push(context.clone());
        sets.push(format!("context = ${}", binds.len()));
    }
    if let Some(ref metadata) = patch.metadata {
        binds.push(metadata.as_ref().map(|m| m.to_string()));
        sets.push(format!("metadata = ${}::jsonb", binds.len()));
    }

    let idx_placeholder = binds.len() + 1;
    let sql = format!(
        "UPDATE claims SET {} WHERE id = ${idx_placeholder} RETURNING {SELECT_COLUMNS}",
        sets.join(", ")
    );

    let mut query = sqlx::query_as::<_, ClaimRow>(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }
    query = query.bind(id);

    let row = query
        .fetch_optional(pool)
        .await
        .context("failed to patch claim")?;

    Ok(row.map(ClaimRow::into_claim))
}

/// Atomically set the claimant and transition `status` to `active`.
pub async fn claim_issue(
    pool: &PgPool,
    id: Uuid,
    claimant: &Claimant,
) -> Result<Option<Claim>> {
    let (claimant_type, user_id, name, agent_id, agent_type): (
        &str,
        Option<&str>,
        Option<&str>,
        Option<&str>,
        Option<&str>,
    ) = match claimant {
        Claimant::Human { user_id, name } => ("human", Some(user_id), Some(name), None, None),
        Claimant::Agent {
            agent_id,
            agent_type,
        } => ("agent", None, None, Some(agent_id), Some(agent_type)),
    };

    let row = sqlx::query_as::<_, ClaimRow>(&format!(
        "UPDATE claims SET status = 'active', claimant_type = $1, claimant_user_id = $2, \
         claimant_name = $3, claimant_agent_id = $4, claimant_agent_type = $5, updated_at = now() \
         WHERE id = $6 RETURNING {SELECT_COLUMNS}"
    ))
    .bind(claimant_type)
    .bind(user_id)
    .bind(name)
    .bind(agent_id)
    .bind(agent_type)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to claim issue")?;

    Ok(row.map(ClaimRow::into_claim))
}

/// Clear the claimant and transition `status` back to `backlog`.
pub async fn release_claim(pool: &PgPool, id: Uuid) -> Result<Option<Claim>> {
    let row = sqlx::query_as::<_, ClaimRow>(&format!(
        "UPDATE claims SET status = 'backlog', claimant_type = NULL, claimant_user_id = NULL, \
         claimant_name = NULL, claimant_agent_id = NULL, claimant_agent_type = NULL, \
         updated_at = now() WHERE id = $1 RETURNING {SELECT_COLUMNS}"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to release claim")?;

    Ok(row.map(ClaimRow::into_claim))
}

/// Delete a claim by internal id. Returns whether a row was removed.
pub async fn delete_claim(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM claims WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete claim")?;

    Ok(result.rows_affected() > 0)
}
