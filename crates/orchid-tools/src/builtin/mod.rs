// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bash;
mod edit_file;
mod glob_search;
mod grep;
mod list_dir;
mod read_file;
mod web_fetch;
mod write_file;

pub use bash::BashTool;
pub use edit_file::EditFileTool;
pub use glob_search::GlobTool;
pub use grep::GrepTool;
pub use list_dir::ListDirTool;
pub use read_file::ReadFileTool;
pub use web_fetch::WebFetchTool;
pub use write_file::WriteFileTool;
