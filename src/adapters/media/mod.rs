//! Content-addressed media store.

pub mod store;

pub use store::{
    FileCheck, MediaPlacement, MediaStore, check_file, media_file_name, media_id,
    remove_chat_files,
};
