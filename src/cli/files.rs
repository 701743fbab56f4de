use std::path::Path;

use crate::error::Result;
use crate::files::{FileObject, FileStore, FilesClient};

pub async fn run_upload(root: &Path, file: &Path, purpose: &str) -> Result<()> {
    let client = FilesClient::from_project(root)?;
    let uploaded = client.upload(file, purpose).await?;
    eprintln!("artel-wire: uploaded {}", file.display());
    print_file(&uploaded);
    Ok(())
}

pub async fn run_list(root: &Path, purpose: Option<&str>) -> Result<()> {
    let client = FilesClient::from_project(root)?;
    let files = client.list(purpose).await?;
    if files.is_empty() {
        println!("No files.");
        return Ok(());
    }
    for file in &files {
        println!(
            "{}  {:>10}  {:<14}  {}",
            file.id, file.bytes, file.purpose, file.filename
        );
    }
    println!("{} file(s)", files.len());
    Ok(())
}

pub async fn run_get(root: &Path, id: &str, content: bool) -> Result<()> {
    let client = FilesClient::from_project(root)?;
    if content {
        print!("{}", client.content(id).await?);
    } else {
        print_file(&client.get(id).await?);
    }
    Ok(())
}

/// Returns whether the store confirmed the deletion.
pub async fn run_delete(root: &Path, id: &str) -> Result<bool> {
    let client = FilesClient::from_project(root)?;
    let deleted = client.delete(id).await?;
    if deleted {
        eprintln!("artel-wire: deleted {}", id);
    } else {
        eprintln!("artel-wire: {} was not deleted", id);
    }
    Ok(deleted)
}

fn print_file(file: &FileObject) {
    println!("ID:       {}", file.id);
    println!("Filename: {}", file.filename);
    println!("Bytes:    {}", file.bytes);
    println!("Purpose:  {}", file.purpose);
    println!("Created:  {}", file.created_at);
}
