//! Document schema for one inverted index.

use tantivy::schema::{
    IndexRecordOption, Schema, SchemaBuilder, TextFieldIndexing, TextOptions, FAST, STORED,
    STRING,
};

/// Field handles resolved once against the schema, cheap to clone (Tantivy
/// `Field` is a small copyable index).
#[derive(Debug, Clone, Copy)]
pub struct DocumentFields {
    pub id: tantivy::schema::Field,
    pub path: tantivy::schema::Field,
    pub filename: tantivy::schema::Field,
    pub extension: tantivy::schema::Field,
    pub directory: tantivy::schema::Field,
    pub relative_path: tantivy::schema::Field,
    pub relative_directory: tantivy::schema::Field,
    pub directory_name: tantivy::schema::Field,
    pub size: tantivy::schema::Field,
    pub last_modified: tantivy::schema::Field,
    pub content: tantivy::schema::Field,
    pub filename_text: tantivy::schema::Field,
    pub directory_text: tantivy::schema::Field,
    pub language: tantivy::schema::Field,
}

/// Name of the custom tokenizer registered on every index this store opens.
pub const CODE_TOKENIZER: &str = "code";

fn code_text_options() -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(CODE_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored()
}

fn code_text_options_unstored() -> TextOptions {
    TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(CODE_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    )
}

pub fn build_schema() -> (Schema, DocumentFields) {
    let mut builder: SchemaBuilder = Schema::builder();

    let id = builder.add_text_field("id", STRING | STORED);
    let path = builder.add_text_field("path", STORED);
    let filename = builder.add_text_field("filename", STORED);
    let extension = builder.add_text_field("extension", STRING | STORED);
    let directory = builder.add_text_field("directory", STORED);
    let relative_path = builder.add_text_field("relative_path", STORED);
    let relative_directory = builder.add_text_field("relative_directory", STORED);
    let directory_name = builder.add_text_field("directory_name", STORED);
    let size = builder.add_i64_field("size", STORED | FAST);
    let last_modified = builder.add_i64_field("last_modified", STORED | FAST);
    let content = builder.add_text_field("content", code_text_options_unstored());
    let filename_text = builder.add_text_field("filename_text", code_text_options());
    let directory_text = builder.add_text_field("directory_text", code_text_options());
    let language = builder.add_text_field("language", STRING | STORED);

    let schema = builder.build();
    let fields = DocumentFields {
        id,
        path,
        filename,
        extension,
        directory,
        relative_path,
        relative_directory,
        directory_name,
        size,
        last_modified,
        content,
        filename_text,
        directory_text,
        language,
    };
    (schema, fields)
}
