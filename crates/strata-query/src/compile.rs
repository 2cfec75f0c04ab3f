use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::filter::{self, Condition, FilterClause, FilterSet};
use crate::macros::MacroRegistry;
use crate::sort::parse_sorts;
use crate::xql::{Xql, resolve_paging};

/// System fields stripped from every returned document.
const UNSET_FIELDS: &str = "['_id', '_rev', '_old_rev']";

/// Hook applied to the normalized tree of every query level right before
/// emission; used by callers for role-based filter injection.
pub type ParserHook<'a> = &'a dyn Fn(Xql) -> Xql;

/// Monotonic generator of 6-digit name suffixes.
///
/// Every bind variable and collection placeholder gets a fresh suffix so
/// that names never collide across query levels and joins.
pub struct NonceGen {
    counter: AtomicU64,
}

impl NonceGen {
    pub fn new() -> Self {
        NonceGen {
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}", 100_000 + n % 900_000)
    }
}

impl Default for NonceGen {
    fn default() -> Self {
        NonceGen::new()
    }
}

/// Compiles XQL trees into native queries plus bind variables.
pub struct Compiler {
    max_limit: u64,
    macros: MacroRegistry,
    nonces: NonceGen,
}

impl Compiler {
    pub fn new(max_limit: u64) -> Self {
        Compiler {
            max_limit,
            macros: MacroRegistry::default(),
            nonces: NonceGen::new(),
        }
    }

    pub fn with_macros(max_limit: u64, macros: MacroRegistry) -> Self {
        Compiler {
            max_limit,
            macros,
            nonces: NonceGen::new(),
        }
    }

    pub fn max_limit(&self) -> u64 {
        self.max_limit
    }

    /// Compile a query tree into `(query text, bind variables)`.
    pub fn compile(&self, xql: &Xql) -> Result<(String, Map<String, Value>), QueryError> {
        self.compile_with(xql, None)
    }

    /// Compile with caller-supplied variables merged into the bind map.
    ///
    /// The query references them through `#`-literal filter values
    /// (`"#@my_var"`), which compile verbatim instead of minting a bind
    /// variable.
    pub fn compile_with_vars(
        &self,
        xql: &Xql,
        vars: &Map<String, Value>,
        parser: Option<ParserHook<'_>>,
    ) -> Result<(String, Map<String, Value>), QueryError> {
        let (query, mut bind_vars) = self.compile_with(xql, parser)?;
        for (key, value) in vars {
            bind_vars.insert(key.clone(), value.clone());
        }
        Ok((query, bind_vars))
    }

    /// Compile with a parser hook that may rewrite each normalized level.
    pub fn compile_with(
        &self,
        xql: &Xql,
        parser: Option<ParserHook<'_>>,
    ) -> Result<(String, Map<String, Value>), QueryError> {
        let mut xql = xql.clone();
        if let Some(parser) = parser {
            xql = parser(xql);
        }
        if xql.from.is_empty() {
            return Err(QueryError::MissingFrom);
        }

        let alias = xql.alias().to_string();
        let paging = resolve_paging(&xql, self.max_limit);
        let nonce = self.nonces.next();

        let mut bind_vars = Map::new();
        let filters = filter::parse_filters(&xql.filters)?;
        let filter_clauses = self.compile_filters(&filters, &alias, &mut bind_vars);

        // Subqueries bind before the main loop so the outer filters can
        // reference their aliases.
        let mut bindings = String::new();
        for join in &xql.join {
            let (sub_query, sub_vars) = self.compile_with(join, parser)?;
            bindings.push_str(&format!("LET {} = ({})\n", join.alias(), sub_query));
            bind_vars.extend(sub_vars);
        }

        let mut query = bindings;
        query.push_str(&format!("FOR {alias} IN @@collection_{nonce}\n"));
        query.push_str(&filter_clauses);
        if let Some(count_as) = xql.count_as.as_deref().filter(|c| !c.is_empty()) {
            query.push_str(&format!("COLLECT WITH COUNT INTO {count_as}\n"));
        }
        query.push_str(&format!("LIMIT @offset_{nonce}, @limit_{nonce}\n"));
        if let Some(sort) = &xql.sort {
            let sorts = parse_sorts(sort);
            if !sorts.is_empty() {
                let directives: Vec<String> = sorts
                    .iter()
                    .map(|s| format!("{alias}.{} {}", s.field, s.direction.aql()))
                    .collect();
                query.push_str(&format!("SORT {}\n", directives.join(", ")));
            }
        }
        query.push_str(&format!(
            "RETURN UNSET_RECURSIVE({}, {UNSET_FIELDS})",
            xql.return_expr()
        ));

        bind_vars.insert(format!("offset_{nonce}"), Value::from(paging.offset));
        bind_vars.insert(format!("limit_{nonce}"), Value::from(paging.limit));
        bind_vars.insert(format!("@collection_{nonce}"), Value::from(xql.from.clone()));

        Ok((query, bind_vars))
    }

    fn compile_filters(
        &self,
        filters: &FilterSet,
        alias: &str,
        bind_vars: &mut Map<String, Value>,
    ) -> String {
        let mut out = String::new();
        for clause in &filters.clauses {
            match clause {
                FilterClause::Leaf(cond) => {
                    let expr = self.compile_condition(cond, alias, bind_vars);
                    out.push_str(&format!("FILTER ({expr})\n"));
                }
                FilterClause::Group {
                    logic,
                    alternatives,
                } => {
                    for alternative in alternatives {
                        let exprs: Vec<String> = alternative
                            .iter()
                            .map(|cond| self.compile_condition(cond, alias, bind_vars))
                            .collect();
                        out.push_str(&format!(
                            "FILTER ({})\n",
                            exprs.join(logic.connective())
                        ));
                    }
                }
            }
        }
        out
    }

    fn compile_condition(
        &self,
        cond: &Condition,
        alias: &str,
        bind_vars: &mut Map<String, Value>,
    ) -> String {
        let value = self.macros.eval(&cond.value);
        let operator = cond.op.aql();

        // A leading `#` marks a literal reference (another alias's field or a
        // pre-bound variable) that must not become a bind variable.
        if let Some(literal) = value.as_str().and_then(|s| s.strip_prefix('#')) {
            return if cond.op.reversed() {
                format!("{literal} {operator} {alias}.{}", cond.path)
            } else {
                format!("{alias}.{} {operator} {literal}", cond.path)
            };
        }

        let ukey = format!("{}_{}", slugify_path(&cond.path), self.nonces.next());
        let expr = if cond.op.reversed() {
            format!("@{ukey} {operator} {alias}.{}", cond.path)
        } else {
            format!("{alias}.{} {operator} @{ukey}", cond.path)
        };
        bind_vars.insert(ukey, value);
        expr
    }
}

/// Reduce a dotted path to a bind-variable-safe name: lowercase, with every
/// run of non-alphanumeric characters collapsed to a single underscore.
pub fn slugify_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_sep = false;
    for ch in path.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    if out.ends_with('_') {
        out.pop();
    }
    out
}

/// Whether a query contains data-modification operations. Used by callers to
/// enforce read-only execution.
pub fn has_modifier_operations(query: &str) -> bool {
    const MODIFIERS: &[&str] = &["REMOVE", "UPDATE", "REPLACE", "INSERT", "UPSERT"];
    query
        .split_whitespace()
        .any(|token| MODIFIERS.iter().any(|m| token.eq_ignore_ascii_case(m)))
}

/// Collection names referenced by the tree and all nested joins, sorted and
/// deduplicated. Used for authorization pre-checks.
pub fn extract_collections(xql: &Xql) -> Vec<String> {
    fn walk(xql: &Xql, out: &mut Vec<String>) {
        for join in &xql.join {
            walk(join, out);
        }
        out.push(xql.from.clone());
    }
    let mut out = Vec::new();
    walk(xql, &mut out);
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn xql(v: Value) -> Xql {
        Xql::from_value(v).unwrap()
    }

    fn find_var<'a>(vars: &'a Map<String, Value>, prefix: &str) -> (&'a str, &'a Value) {
        vars.iter()
            .find(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
            .unwrap_or_else(|| panic!("no bind var with prefix {prefix}: {vars:?}"))
    }

    #[test]
    fn simple_query_shape() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {"age:$gt": 18},
                "LIMIT": 5,
                "PAGE": 2
            })))
            .unwrap();

        assert!(query.contains("FOR root__ IN @@collection_"), "{query}");
        assert!(query.contains("FILTER (root__.age > @age_"), "{query}");
        assert!(query.contains("LIMIT @offset_"), "{query}");
        assert!(
            query.contains("RETURN UNSET_RECURSIVE(root__, ['_id', '_rev', '_old_rev'])"),
            "{query}"
        );

        assert_eq!(vars.len(), 4);
        assert_eq!(find_var(&vars, "@collection_").1, &json!("users"));
        assert_eq!(find_var(&vars, "offset_").1, &json!(5));
        assert_eq!(find_var(&vars, "limit_").1, &json!(5));
        assert_eq!(find_var(&vars, "age_").1, &json!(18));
    }

    #[test]
    fn filter_bind_var_is_referenced_in_query() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({"FROM": "users", "FILTERS": {"name": "ada"}})))
            .unwrap();
        let (key, _) = find_var(&vars, "name_");
        assert!(query.contains(&format!("root__.name == @{key}")), "{query}");
    }

    #[test]
    fn join_binds_before_outer_loop_and_literal_reference() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({
                "FROM": "posts",
                "ALIAS": "post",
                "FILTERS": {"authorId:$eq": "#u._key"},
                "JOIN": [{
                    "FROM": "users",
                    "ALIAS": "u",
                    "FILTERS": {"active": true}
                }]
            })))
            .unwrap();

        let let_pos = query.find("LET u = (FOR u IN @@collection_").expect(&query);
        let for_pos = query.find("FOR post IN @@collection_").unwrap();
        assert!(let_pos < for_pos, "{query}");

        // The `#` literal compiles verbatim, without a bind variable.
        assert!(query.contains("post.authorId == u._key"), "{query}");
        assert!(!vars.keys().any(|k| k.starts_with("authorid")), "{vars:?}");

        // The join's bind vars are merged with fresh suffixes.
        let (active_key, active) = find_var(&vars, "active_");
        assert_eq!(active, &json!(true));
        assert!(query.contains(&format!("u.active == @{active_key}")), "{query}");
        assert_eq!(vars.keys().filter(|k| k.starts_with("@collection_")).count(), 2);
    }

    #[test]
    fn nested_joins_get_distinct_collection_vars() {
        let compiler = Compiler::new(100);
        let (_, vars) = compiler
            .compile(&xql(json!({
                "FROM": "a",
                "JOIN": [
                    {"FROM": "b", "ALIAS": "b", "JOIN": [{"FROM": "c", "ALIAS": "c"}]},
                    {"FROM": "d", "ALIAS": "d"}
                ]
            })))
            .unwrap();
        let collections: Vec<&String> = vars
            .keys()
            .filter(|k| k.starts_with("@collection_"))
            .collect();
        assert_eq!(collections.len(), 4);
        let unique: std::collections::BTreeSet<_> = collections.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn logic_group_joins_leaves_with_connective() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {
                    "$or": [{"status": "active", "score:$gt": 10}]
                }
            })))
            .unwrap();
        let (status_key, _) = find_var(&vars, "status_");
        let (score_key, _) = find_var(&vars, "score_");
        assert!(
            query.contains(&format!(
                "FILTER (root__.status == @{status_key} OR root__.score > @{score_key})"
            )),
            "{query}"
        );
    }

    #[test]
    fn logic_group_emits_one_clause_per_alternative() {
        let compiler = Compiler::new(100);
        let (query, _) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {
                    "$and": [{"a": 1}, {"b": 2}]
                }
            })))
            .unwrap();
        assert_eq!(query.matches("FILTER (").count(), 2, "{query}");
    }

    #[test]
    fn includes_swaps_operand_order() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {"cities:$includes": "charlotte"}
            })))
            .unwrap();
        let (key, _) = find_var(&vars, "cities_");
        assert!(query.contains(&format!("@{key} IN root__.cities")), "{query}");
    }

    #[test]
    fn xincludes_negates_containment() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {"cities:$xincludes": "gotham"}
            })))
            .unwrap();
        let (key, _) = find_var(&vars, "cities_");
        assert!(
            query.contains(&format!("@{key} NOT IN root__.cities")),
            "{query}"
        );
    }

    #[test]
    fn count_as_emits_collect_clause() {
        let compiler = Compiler::new(100);
        let (query, _) = compiler
            .compile(&xql(json!({"FROM": "users", "COUNT_AS": "total"})))
            .unwrap();
        assert!(query.contains("COLLECT WITH COUNT INTO total\n"), "{query}");
    }

    #[test]
    fn sort_clause_from_map() {
        let compiler = Compiler::new(100);
        let (query, _) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "SORT": {"name": "desc", "age": 1}
            })))
            .unwrap();
        assert!(
            query.contains("SORT root__.name DESC, root__.age ASC\n"),
            "{query}"
        );
    }

    #[test]
    fn limit_clamped_to_max() {
        let compiler = Compiler::new(25);
        let (_, vars) = compiler
            .compile(&xql(json!({"FROM": "users", "LIMIT": 500})))
            .unwrap();
        assert_eq!(find_var(&vars, "limit_").1, &json!(25));
    }

    #[test]
    fn dotted_paths_slug_into_bind_names() {
        let compiler = Compiler::new(100);
        let (query, vars) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {"profile.address.city": "Austin"}
            })))
            .unwrap();
        let (key, _) = find_var(&vars, "profile_address_city_");
        assert!(
            query.contains(&format!("root__.profile.address.city == @{key}")),
            "{query}"
        );
    }

    #[test]
    fn missing_from_errors() {
        let compiler = Compiler::new(100);
        let err = compiler.compile(&Xql::default()).unwrap_err();
        assert_eq!(err, QueryError::MissingFrom);
    }

    #[test]
    fn parser_hook_rewrites_every_level() {
        let compiler = Compiler::new(100);
        let hook = |mut xql: Xql| {
            xql.filters
                .insert("tenant".to_string(), json!("acme"));
            xql
        };
        let (query, vars) = compiler
            .compile_with(
                &xql(json!({
                    "FROM": "posts",
                    "ALIAS": "post",
                    "JOIN": [{"FROM": "users", "ALIAS": "u"}]
                })),
                Some(&hook),
            )
            .unwrap();
        assert!(query.contains("post.tenant == @tenant_"), "{query}");
        assert!(query.contains("u.tenant == @tenant_"), "{query}");
        assert_eq!(vars.keys().filter(|k| k.starts_with("tenant_")).count(), 2);
    }

    #[test]
    fn caller_vars_merge_into_bind_map() {
        let compiler = Compiler::new(100);
        let mut vars = Map::new();
        vars.insert("role".to_string(), json!("admin"));
        let (query, bind_vars) = compiler
            .compile_with_vars(
                &xql(json!({"FROM": "users", "FILTERS": {"role": "#@role"}})),
                &vars,
                None,
            )
            .unwrap();
        assert!(query.contains("root__.role == @role"), "{query}");
        assert_eq!(bind_vars["role"], json!("admin"));
        assert!(!bind_vars.keys().any(|k| k.starts_with("role_")), "{bind_vars:?}");
    }

    #[test]
    fn bind_names_are_unique_per_compilation() {
        let compiler = Compiler::new(100);
        let (_, vars) = compiler
            .compile(&xql(json!({
                "FROM": "users",
                "FILTERS": {
                    "$or": [{"a": 1}, {"a": 2}],
                    "a:$gt": 3
                }
            })))
            .unwrap();
        assert_eq!(vars.keys().filter(|k| k.starts_with("a_")).count(), 3);
    }

    #[test]
    fn nonce_gen_is_monotonic_and_six_digits() {
        let nonces = NonceGen::new();
        let a = nonces.next();
        let b = nonces.next();
        assert_ne!(a, b);
        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 6);
    }

    #[test]
    fn slugify_path_cases() {
        assert_eq!(slugify_path("age"), "age");
        assert_eq!(slugify_path("some.deep.path"), "some_deep_path");
        assert_eq!(slugify_path("AuthorId"), "authorid");
        assert_eq!(slugify_path("_perms.read"), "perms_read");
    }

    #[test]
    fn detects_modifier_operations() {
        assert!(has_modifier_operations("FOR u IN users REMOVE u IN users"));
        assert!(has_modifier_operations("insert {v: 1} into log"));
        assert!(!has_modifier_operations(
            "FOR u IN users FILTER u.updated == true RETURN u"
        ));
    }

    #[test]
    fn extracts_collections_recursively() {
        let tree = xql(json!({
            "FROM": "posts",
            "JOIN": [
                {"FROM": "users", "JOIN": [{"FROM": "orgs"}]},
                {"FROM": "users"}
            ]
        }));
        assert_eq!(extract_collections(&tree), vec!["orgs", "posts", "users"]);
    }
}
