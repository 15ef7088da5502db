pub mod instruction;
pub mod list;
pub mod story_data;
pub mod value;
