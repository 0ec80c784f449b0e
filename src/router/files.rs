/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::debug;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Resource {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub contents: Vec<u8>,
}

/// Maps a logical request path to resource contents.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, logical_path: &str) -> Result<Resource, FileError>;
}

/// Serves files from one directory. Paths escaping the directory are
/// refused.
pub struct StaticDir {
    root: PathBuf,
}

impl StaticDir {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceResolver for StaticDir {
    fn resolve(&self, logical_path: &str) -> Result<Resource, FileError> {
        let rel = Path::new(logical_path.trim_start_matches('/'));

        for c in rel.components() {
            match c {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(FileError::Forbidden(logical_path.to_string())),
            }
        }

        let root = match fs::canonicalize(&self.root) {
            Ok(root) => root,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FileError::NotFound(logical_path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let path = match fs::canonicalize(root.join(rel)) {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FileError::NotFound(logical_path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        // symlinks may point outside
        if !path.starts_with(&root) {
            return Err(FileError::Forbidden(logical_path.to_string()));
        }

        let meta = fs::metadata(&path)?;

        if !meta.is_file() {
            return Err(FileError::NotFound(logical_path.to_string()));
        }

        let contents = fs::read(&path)?;

        debug!("resolved {} to {}", logical_path, path.display());

        Ok(Resource {
            path,
            modified: meta.modified()?,
            contents,
        })
    }
}

pub fn mime_type(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };

    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
