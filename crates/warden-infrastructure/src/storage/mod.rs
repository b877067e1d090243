pub mod atomic_file;

pub use atomic_file::{
    read_json, remove_if_exists, temp_path_for, write_atomic, write_atomic_sync, write_json_atomic,
};
