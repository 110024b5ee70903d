mod store;
pub use store::GraphStore;

mod writer;

mod retrieval;
pub use retrieval::RetrievedUnit;
