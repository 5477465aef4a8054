use anyhow::{bail, Result};

use super::schema::Database;
use super::types::Category;
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    /// Maximum nesting depth for categories.
    /// Root = depth 0, child = depth 1, grandchild = depth 2.
    /// A category at depth 3 is rejected.
    pub const MAX_CATEGORY_DEPTH: i64 = 3;

    /// SEC-014: Strip control characters, trim, and reject empty names.
    fn sanitize_category_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Category name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Create a new category, returning its ID.
    ///
    /// If `parent_id` is `Some`, the parent chain depth is validated.
    /// Creating a category that would exceed [`Self::MAX_CATEGORY_DEPTH`]
    /// levels is rejected.
    pub async fn create_category(&self, name: &str, parent_id: Option<i64>) -> Result<i64> {
        let clean_name = Self::sanitize_category_name(name)?;

        if let Some(pid) = parent_id {
            let depth = self.ancestor_depth(pid).await?;
            if depth + 1 >= Self::MAX_CATEGORY_DEPTH {
                bail!(
                    "Cannot create category: maximum nesting depth ({}) would be exceeded",
                    Self::MAX_CATEGORY_DEPTH
                );
            }
        }

        let row: (i64,) =
            sqlx::query_as("INSERT INTO categories (name, parent_id) VALUES (?, ?) RETURNING id")
                .bind(&clean_name)
                .bind(parent_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(row.0)
    }

    /// Resolve a slash-separated category path such as `"Tech/Rust"`,
    /// creating missing segments. Returns the leaf category ID, or `None`
    /// for an empty path.
    pub async fn ensure_category_path(&self, path: &str) -> Result<Option<i64>> {
        let mut parent: Option<i64> = None;

        for segment in path.split('/').map(str::trim).filter(|s| !s.is_empty()) {
            let name = Self::sanitize_category_name(segment)?;

            // `IS ?` matches NULL parents as well as concrete ones
            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM categories WHERE name = ? AND parent_id IS ? ORDER BY id LIMIT 1",
            )
            .bind(&name)
            .bind(parent)
            .fetch_optional(&self.pool)
            .await?;

            parent = Some(match existing {
                Some((id,)) => id,
                None => self.create_category(&name, parent).await?,
            });
        }

        Ok(parent)
    }

    /// Get all categories as a flat list; callers build the tree from `parent_id`.
    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let rows: Vec<(i64, String, Option<i64>)> =
            sqlx::query_as("SELECT id, name, parent_id FROM categories ORDER BY name, id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, parent_id)| Category {
                id,
                name,
                parent_id,
            })
            .collect())
    }

    /// Compute the depth of a category by walking its ancestor chain.
    /// Root categories have depth 0.
    ///
    /// LIMIT 50 on the recursive CTE bounds the walk if corrupted data forms a cycle.
    async fn ancestor_depth(&self, category_id: i64) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            WITH RECURSIVE ancestors(id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM categories WHERE id = ?
                UNION ALL
                SELECT c.id, c.parent_id, a.depth + 1
                FROM categories c
                JOIN ancestors a ON c.id = a.parent_id
                LIMIT 50
            )
            SELECT MAX(depth) FROM ancestors
            "#,
        )
        .bind(category_id)
        .fetch_one(&self.pool)
        .await?;

        match row.0 {
            Some(depth) => Ok(depth),
            None => bail!("Category {} does not exist", category_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_category() {
        let db = test_db().await;

        let id = db.create_category("Tech", None).await.unwrap();
        assert!(id > 0);

        let categories = db.list_categories().await.unwrap();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].name, "Tech");
        assert_eq!(categories[0].parent_id, None);
    }

    #[tokio::test]
    async fn test_create_category_rejects_blank_name() {
        let db = test_db().await;
        assert!(db.create_category("   ", None).await.is_err());
        assert!(db.create_category("\x1b[31m", None).await.is_err());
    }

    #[tokio::test]
    async fn test_max_depth_enforced() {
        let db = test_db().await;

        let root = db.create_category("Root", None).await.unwrap();
        let child = db.create_category("Child", Some(root)).await.unwrap();
        let grandchild = db.create_category("Grandchild", Some(child)).await.unwrap();

        let result = db.create_category("TooDeep", Some(grandchild)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("maximum nesting depth"));
    }

    #[tokio::test]
    async fn test_ensure_category_path_creates_chain() {
        let db = test_db().await;

        let leaf = db.ensure_category_path("Tech/Rust").await.unwrap().unwrap();

        let categories = db.list_categories().await.unwrap();
        assert_eq!(categories.len(), 2);
        let rust = categories.iter().find(|c| c.id == leaf).unwrap();
        assert_eq!(rust.name, "Rust");
        let tech = categories.iter().find(|c| c.name == "Tech").unwrap();
        assert_eq!(rust.parent_id, Some(tech.id));
        assert_eq!(tech.parent_id, None);
    }

    #[tokio::test]
    async fn test_ensure_category_path_reuses_existing() {
        let db = test_db().await;

        let first = db.ensure_category_path("Tech/Rust").await.unwrap();
        let second = db.ensure_category_path(" Tech / Rust ").await.unwrap();
        assert_eq!(first, second);

        let sibling = db.ensure_category_path("Tech/Go").await.unwrap();
        assert_ne!(first, sibling);
        assert_eq!(db.list_categories().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_ensure_category_path_empty() {
        let db = test_db().await;
        assert_eq!(db.ensure_category_path("").await.unwrap(), None);
        assert_eq!(db.ensure_category_path(" / ").await.unwrap(), None);
    }
}
