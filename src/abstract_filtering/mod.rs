mod filtering_interface;
mod local_filtering;
mod search_matching;

pub use filtering_interface::{
    EffectiveBounds, SearchHit, SearchRequest, SearchResult, SearchResultKind, TreeFiltering,
};
pub use local_filtering::LocalFiltering;
pub use search_matching::search_node_ids;
