//! Version 1. Messaging tables (`chats`, `membership_events`, `contacts`, `messages`,
//! `raw_messages`, `installations`) and the encryption layer's key material
//! (`bundles`, `sessions`, `secrets`).

pub(super) const SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                     TEXT PRIMARY KEY NOT NULL,
    chat_type              TEXT NOT NULL,            -- one_to_one | public | private_group
    name                   TEXT NOT NULL,
    active                 INTEGER NOT NULL,
    timestamp              INTEGER NOT NULL,         -- ms since epoch
    last_clock_value       INTEGER NOT NULL,
    deleted_at_clock_value INTEGER NOT NULL,
    unviewed_count         INTEGER NOT NULL,
    last_message_id        TEXT                      -- 0x-hex message id
);

-- ----------------------------------------------------------------
-- Membership events (append-only, keyed by signature)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS membership_events (
    chat_id    TEXT NOT NULL,
    signature  TEXT NOT NULL,                        -- hex-encoded event signature
    clock      INTEGER NOT NULL,
    data       BLOB NOT NULL,                        -- bincode-encoded event

    PRIMARY KEY (chat_id, signature),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_membership_events_chat_clock
    ON membership_events(chat_id, clock);

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    id           TEXT PRIMARY KEY NOT NULL,          -- 0x-hex public key
    name         TEXT NOT NULL,
    alias        TEXT NOT NULL,
    identicon    TEXT NOT NULL,
    system_tags  TEXT NOT NULL,                      -- JSON array
    last_updated INTEGER NOT NULL,                   -- Lamport clock
    ens_verified INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY NOT NULL,     -- 0x-hex content hash
    chat_id           TEXT NOT NULL,
    sender            TEXT NOT NULL,                 -- 0x-hex public key
    clock             INTEGER NOT NULL,
    whisper_timestamp INTEGER NOT NULL,
    timestamp         INTEGER NOT NULL,
    text              TEXT NOT NULL,
    content_type      TEXT NOT NULL,
    outgoing_status   TEXT,                          -- NULL | sending | sent
    seen              INTEGER NOT NULL,
    response_to       TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_clock
    ON messages(chat_id, clock DESC);

-- ----------------------------------------------------------------
-- Raw outbound payloads kept for re-sending
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS raw_messages (
    id            TEXT PRIMARY KEY NOT NULL,
    local_chat_id TEXT NOT NULL,
    payload       BLOB NOT NULL,                     -- signed metadata envelope
    message_type  TEXT NOT NULL,
    recipients    TEXT NOT NULL,                     -- JSON array of 0x-hex keys
    send_count    INTEGER NOT NULL,
    sent          INTEGER NOT NULL,
    last_sent     INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Paired installations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS installations (
    identity    TEXT NOT NULL,
    id          TEXT NOT NULL,
    enabled     INTEGER NOT NULL,
    name        TEXT NOT NULL,
    device_type TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,

    PRIMARY KEY (identity, id)
);

-- ----------------------------------------------------------------
-- Encryption key material
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bundles (
    identity        TEXT NOT NULL,
    installation_id TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    data            BLOB NOT NULL,

    PRIMARY KEY (identity, installation_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    peer        TEXT NOT NULL,
    session_key TEXT NOT NULL,
    data        BLOB NOT NULL,

    PRIMARY KEY (peer, session_key)
);

CREATE TABLE IF NOT EXISTS secrets (
    name  TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
);
"#;
