//! Wires the tag-query evaluator contract to the merge
//! iterator: picks the logs a merge should run over.

use std::sync::Arc;

use solaris_common::error::Result;
use solaris_common::metadata::{LogQuery, MetadataStore};
use solaris_common::model::Log;
use solaris_common::query::QueryEvaluator;

/// Returns every non-deleted log whose tags satisfy `evaluator`, the
/// input list [`crate::merge::MergeIterator`] is built over.
pub async fn select_logs(metadata: &dyn MetadataStore, evaluator: &dyn QueryEvaluator) -> Result<Vec<Log>> {
    let logs = metadata.query_logs(LogQuery::default()).await?;
    Ok(logs.into_iter().filter(|log| evaluator.matches(&log.tags)).collect())
}

/// Convenience wrapper taking an `Arc<dyn MetadataStore>`, the shape
/// [`crate::local_log::LocalLogEngine`] stores it in.
pub async fn select_logs_arc(metadata: &Arc<dyn MetadataStore>, evaluator: &dyn QueryEvaluator) -> Result<Vec<Log>> {
    select_logs(metadata.as_ref(), evaluator).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadataStore;
    use solaris_common::query::TagEquals;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn selects_only_matching_logs() {
        let store = InMemoryMetadataStore::new();

        let mut prod_tags = BTreeMap::new();
        prod_tags.insert("env".to_string(), "prod".to_string());
        let prod_log = store.create_log(Log::new(prod_tags)).await.unwrap();

        let mut staging_tags = BTreeMap::new();
        staging_tags.insert("env".to_string(), "staging".to_string());
        store.create_log(Log::new(staging_tags)).await.unwrap();

        let mut terms = BTreeMap::new();
        terms.insert("env".to_string(), "prod".to_string());
        let evaluator = TagEquals::new(terms);

        let selected = select_logs(&store, &evaluator).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, prod_log.id);
    }
}
