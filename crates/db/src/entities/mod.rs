pub mod document;
pub mod document_index;
pub mod document_unique_key;
