//! SQL schemas, applied idempotently whenever a pool is opened.

/// Management database schema: the domain registry, the DID routing
/// table, and the firehose event log.
pub const MANAGEMENT_SCHEMA: &str = r#"
-- domains: each row is a DNS name hosted by this server. Accounts live
-- under a domain as <handle>.<domain>; db_name records the per-tenant
-- database backing it.
CREATE TABLE IF NOT EXISTS domains (
    id          SERIAL PRIMARY KEY,
    domain      VARCHAR(253) UNIQUE NOT NULL,
    db_name     VARCHAR(253) NOT NULL,
    status      VARCHAR(20) NOT NULL DEFAULT 'active',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_domains_status ON domains(status);

-- did_routing: maps a DID to its home domain. One row per DID hosted
-- here, inserted at account creation and cascaded away with the domain.
CREATE TABLE IF NOT EXISTS did_routing (
    did     VARCHAR(255) PRIMARY KEY,
    domain  VARCHAR(253) NOT NULL REFERENCES domains(domain) ON DELETE CASCADE
);

-- firehose_events: the sequenced commit event log. The BIGSERIAL seq
-- column is the host-global cursor for replay.
CREATE TABLE IF NOT EXISTS firehose_events (
    seq        BIGSERIAL PRIMARY KEY,
    event_type VARCHAR(20) NOT NULL,
    did        VARCHAR(255) NOT NULL,
    payload    BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_firehose_events_seq ON firehose_events(seq);
"#;

/// Per-tenant database schema. Every hosted domain gets its own database
/// with these tables.
pub const TENANT_SCHEMA: &str = r#"
-- accounts: user accounts hosted under this domain. The handle is the
-- user-facing identifier (e.g. "alice.test.local").
CREATE TABLE IF NOT EXISTS accounts (
    id            SERIAL PRIMARY KEY,
    did           VARCHAR(255) UNIQUE NOT NULL,
    handle        VARCHAR(253) UNIQUE NOT NULL,
    email         VARCHAR(255),
    password_hash VARCHAR(255) NOT NULL,
    signing_key   VARCHAR(255),
    role          VARCHAR(20) NOT NULL DEFAULT 'user',
    status        VARCHAR(20) NOT NULL DEFAULT 'active',
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(status);

-- repo_blocks: content-addressed blocks scoped per account. Immutable:
-- rows are only ever inserted.
CREATE TABLE IF NOT EXISTS repo_blocks (
    did   VARCHAR(255) NOT NULL,
    cid   VARCHAR(255) NOT NULL,
    data  BYTEA NOT NULL,
    PRIMARY KEY (did, cid)
);

-- repo_roots: current commit head per account repository.
CREATE TABLE IF NOT EXISTS repo_roots (
    did         VARCHAR(255) PRIMARY KEY REFERENCES accounts(did) ON DELETE CASCADE,
    commit_cid  VARCHAR(255) NOT NULL,
    rev         VARCHAR(50) NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- blobs: content-addressed media storage.
CREATE TABLE IF NOT EXISTS blobs (
    did        VARCHAR(255) NOT NULL,
    cid        VARCHAR(255) NOT NULL,
    mime_type  VARCHAR(255) NOT NULL,
    size       BIGINT NOT NULL,
    data       BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (did, cid)
);
"#;
