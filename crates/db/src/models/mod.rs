pub mod document;
pub mod document_index;
pub mod unique_key;
