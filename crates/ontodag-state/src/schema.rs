//! Idempotent DDL for both SQL dialects.
//!
//! The partial unique index on `dags(datasource_id)` over non-terminal
//! statuses is what makes "one active DAG per datasource" hold across
//! processes sharing a database.

pub const SQLITE_DDL: &str = r"
CREATE TABLE IF NOT EXISTS dags (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    datasource_id TEXT NOT NULL,
    ontology_id TEXT,
    status TEXT NOT NULL,
    current_node TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_dags_one_active
    ON dags (datasource_id) WHERE status IN ('pending', 'running');
CREATE INDEX IF NOT EXISTS idx_dags_datasource_created ON dags (datasource_id, created_at);
CREATE INDEX IF NOT EXISTS idx_dags_project ON dags (project_id);

CREATE TABLE IF NOT EXISTS dag_nodes (
    id TEXT PRIMARY KEY,
    dag_id TEXT NOT NULL REFERENCES dags(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    node_order INTEGER NOT NULL,
    status TEXT NOT NULL,
    progress_current INTEGER,
    progress_total INTEGER,
    progress_message TEXT,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE (dag_id, node_order)
);

CREATE TABLE IF NOT EXISTS relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    datasource_id TEXT NOT NULL,
    source_table TEXT NOT NULL,
    source_column TEXT NOT NULL,
    target_table TEXT NOT NULL,
    target_column TEXT NOT NULL,
    cardinality TEXT NOT NULL,
    confidence REAL NOT NULL,
    inference_method TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, datasource_id, source_table, source_column, target_table, target_column)
);

CREATE TABLE IF NOT EXISTS ontologies (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    datasource_id TEXT NOT NULL,
    dag_id TEXT NOT NULL,
    document TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ontologies_project ON ontologies (project_id, datasource_id);

CREATE TABLE IF NOT EXISTS glossary_terms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ontology_id TEXT NOT NULL REFERENCES ontologies(id) ON DELETE CASCADE,
    term TEXT NOT NULL,
    definition TEXT NOT NULL,
    UNIQUE (ontology_id, term)
);

CREATE TABLE IF NOT EXISTS knowledge_facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    fact TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, fact)
);
";

pub const POSTGRES_DDL: &str = r"
CREATE TABLE IF NOT EXISTS dags (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    datasource_id TEXT NOT NULL,
    ontology_id TEXT,
    status TEXT NOT NULL,
    current_node TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_dags_one_active
    ON dags (datasource_id) WHERE status IN ('pending', 'running');
CREATE INDEX IF NOT EXISTS idx_dags_datasource_created ON dags (datasource_id, created_at);
CREATE INDEX IF NOT EXISTS idx_dags_project ON dags (project_id);

CREATE TABLE IF NOT EXISTS dag_nodes (
    id TEXT PRIMARY KEY,
    dag_id TEXT NOT NULL REFERENCES dags(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    node_order INTEGER NOT NULL,
    status TEXT NOT NULL,
    progress_current BIGINT,
    progress_total BIGINT,
    progress_message TEXT,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE (dag_id, node_order)
);

CREATE TABLE IF NOT EXISTS relationships (
    id BIGSERIAL PRIMARY KEY,
    project_id TEXT NOT NULL,
    datasource_id TEXT NOT NULL,
    source_table TEXT NOT NULL,
    source_column TEXT NOT NULL,
    target_table TEXT NOT NULL,
    target_column TEXT NOT NULL,
    cardinality TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    inference_method TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, datasource_id, source_table, source_column, target_table, target_column)
);

CREATE TABLE IF NOT EXISTS ontologies (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    datasource_id TEXT NOT NULL,
    dag_id TEXT NOT NULL,
    document TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ontologies_project ON ontologies (project_id, datasource_id);

CREATE TABLE IF NOT EXISTS glossary_terms (
    id BIGSERIAL PRIMARY KEY,
    ontology_id TEXT NOT NULL REFERENCES ontologies(id) ON DELETE CASCADE,
    term TEXT NOT NULL,
    definition TEXT NOT NULL,
    UNIQUE (ontology_id, term)
);

CREATE TABLE IF NOT EXISTS knowledge_facts (
    id BIGSERIAL PRIMARY KEY,
    project_id TEXT NOT NULL,
    fact TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, fact)
);
";
