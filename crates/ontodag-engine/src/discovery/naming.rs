//! Column-name conventions and type compatibility used by PK-match inference.

use std::sync::LazyLock;

use regex::Regex;

static SNAKE_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<stem>[a-z0-9_]*[a-z0-9])_(?:id|fk|ref)$").expect("valid reference regex")
});

static CAMEL_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<stem>[a-z][A-Za-z0-9]*?)(?:Id|ID)$").expect("valid camelCase regex")
});

static TYPE_PARAMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(.*\)").expect("valid type params regex"));

/// Minimum singular length for the "stem contains table" partial match,
/// so short table names like `a` or `io` don't match every column.
const MIN_CONTAINED_TABLE_LEN: usize = 3;

/// Extract the referenced entity stem from an identifier-reference column
/// name, lowercased: `customer_id` → `customer`, `orderRef`-style names
/// are not references, `accountID` → `account`.
#[must_use]
pub fn reference_stem(column: &str) -> Option<String> {
    if column.eq_ignore_ascii_case("id") {
        return None;
    }
    if let Some(caps) = SNAKE_REFERENCE_RE.captures(column) {
        return Some(caps["stem"].to_ascii_lowercase());
    }
    CAMEL_REFERENCE_RE
        .captures(column)
        .map(|caps| camel_to_snake(&caps["stem"]))
}

fn camel_to_snake(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len() + 4);
    for (i, ch) in stem.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Plural spellings accepted for an exact match: `s`, `es`, `y → ies`.
#[must_use]
pub fn plural_forms(stem: &str) -> Vec<String> {
    let mut forms = vec![format!("{stem}s"), format!("{stem}es")];
    if let Some(base) = stem.strip_suffix('y') {
        forms.push(format!("{base}ies"));
    }
    forms
}

/// Best-effort singular of a table name.
#[must_use]
pub fn singular(table: &str) -> String {
    if let Some(base) = table.strip_suffix("ies") {
        return format!("{base}y");
    }
    for suffix in ["sses", "xes", "ches", "shes", "zes"] {
        if table.ends_with(suffix) {
            return table[..table.len() - 2].to_string();
        }
    }
    match table.strip_suffix('s') {
        Some(base) if !table.ends_with("ss") && !base.is_empty() => base.to_string(),
        _ => table.to_string(),
    }
}

/// How well a table name matches a reference stem. Ordered best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NameMatch {
    Exact,
    Partial,
}

impl NameMatch {
    /// Base confidence before type-compatibility scaling.
    #[must_use]
    pub fn base_confidence(self) -> f64 {
        match self {
            Self::Exact => 0.9,
            Self::Partial => 0.6,
        }
    }
}

/// Compare a reference stem against a table name, case-insensitively.
#[must_use]
pub fn name_match(stem: &str, table: &str) -> Option<NameMatch> {
    let stem = stem.to_ascii_lowercase();
    let table = table.to_ascii_lowercase();
    if stem.is_empty() {
        return None;
    }
    if table == stem || plural_forms(&stem).contains(&table) {
        return Some(NameMatch::Exact);
    }
    let table_singular = singular(&table);
    if table.contains(&stem)
        || (table_singular.len() >= MIN_CONTAINED_TABLE_LEN && stem.contains(&table_singular))
    {
        return Some(NameMatch::Partial);
    }
    None
}

/// Broad type classes for compatibility scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Text,
    Numeric,
    Uuid,
}

/// Lowercase, drop length/precision parameters and fold common aliases.
#[must_use]
pub fn normalize_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let bare = TYPE_PARAMS_RE.replace_all(&lowered, "");
    let canonical = match bare.trim() {
        "int" | "int4" | "serial" | "serial4" | "mediumint" => "integer",
        "int8" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallserial" | "serial2" => "smallint",
        "character varying" | "varchar2" | "nvarchar" => "varchar",
        "character" | "bpchar" | "nchar" => "char",
        "float8" | "double precision" | "double" => "double",
        "float4" | "float" => "real",
        "decimal" | "number" => "numeric",
        "uniqueidentifier" => "uuid",
        other => other,
    };
    canonical.to_string()
}

/// Family of a normalized type, if it belongs to one.
#[must_use]
pub fn type_family(normalized: &str) -> Option<TypeFamily> {
    match normalized {
        "integer" | "bigint" | "smallint" | "tinyint" => Some(TypeFamily::Integer),
        "text" | "varchar" | "char" | "string" | "citext" => Some(TypeFamily::Text),
        "numeric" | "double" | "real" | "money" => Some(TypeFamily::Numeric),
        "uuid" => Some(TypeFamily::Uuid),
        _ => None,
    }
}

/// Compatibility score of a referencing column type against a primary
/// key type: identical 1.0, same family 0.75, uuid↔text 0.5.
#[must_use]
pub fn type_compatibility(column_type: &str, key_type: &str) -> Option<f64> {
    let a = normalize_type(column_type);
    let b = normalize_type(key_type);
    if a == b {
        return Some(1.0);
    }
    match (type_family(&a), type_family(&b)) {
        (Some(fa), Some(fb)) if fa == fb => Some(0.75),
        (Some(TypeFamily::Uuid), Some(TypeFamily::Text))
        | (Some(TypeFamily::Text), Some(TypeFamily::Uuid)) => Some(0.5),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("user_id", Some("user"))]
    #[case("customer_fk", Some("customer"))]
    #[case("Invoice_Ref", Some("invoice"))]
    #[case("order_item_id", Some("order_item"))]
    #[case("accountId", Some("account"))]
    #[case("parentOrderID", Some("parent_order"))]
    #[case("id", None)]
    #[case("ID", None)]
    #[case("_id", None)]
    #[case("email", None)]
    #[case("paid", None)]
    #[case("Identifier", None)]
    fn reference_stems(#[case] column: &str, #[case] expected: Option<&str>) {
        assert_eq!(reference_stem(column).as_deref(), expected);
    }

    #[rstest]
    #[case("user", "users", Some(NameMatch::Exact))]
    #[case("user", "user", Some(NameMatch::Exact))]
    #[case("box", "boxes", Some(NameMatch::Exact))]
    #[case("category", "categories", Some(NameMatch::Exact))]
    #[case("user", "app_users", Some(NameMatch::Partial))]
    #[case("billing_account", "accounts", Some(NameMatch::Partial))]
    #[case("customer", "Customers", Some(NameMatch::Exact))]
    #[case("user", "orders", None)]
    #[case("order", "io", None)]
    fn name_matches(#[case] stem: &str, #[case] table: &str, #[case] expected: Option<NameMatch>) {
        assert_eq!(name_match(stem, table), expected);
    }

    #[rstest]
    #[case("users", "user")]
    #[case("categories", "category")]
    #[case("addresses", "address")]
    #[case("boxes", "box")]
    #[case("status", "statu")]
    #[case("class", "class")]
    fn singulars(#[case] table: &str, #[case] expected: &str) {
        assert_eq!(singular(table), expected);
    }

    #[rstest]
    #[case("integer", "integer", Some(1.0))]
    #[case("INT4", "integer", Some(1.0))]
    #[case("varchar(255)", "character varying", Some(1.0))]
    #[case("bigint", "integer", Some(0.75))]
    #[case("decimal(10,2)", "numeric", Some(1.0))]
    #[case("text", "varchar", Some(0.75))]
    #[case("uuid", "text", Some(0.5))]
    #[case("varchar(36)", "uuid", Some(0.5))]
    #[case("integer", "uuid", None)]
    #[case("boolean", "integer", None)]
    fn type_scores(#[case] a: &str, #[case] b: &str, #[case] expected: Option<f64>) {
        assert_eq!(type_compatibility(a, b), expected);
    }

    #[test]
    fn exact_beats_partial() {
        assert!(NameMatch::Exact < NameMatch::Partial);
        assert!(NameMatch::Exact.base_confidence() > NameMatch::Partial.base_confidence());
    }
}
