use anyhow::Result;
use futures::StreamExt;

use wharfe::btree::Direction;
use wharfe::btree::DocKey;
use wharfe::btree::Wharfe;
use wharfe::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let tree = Wharfe::try_new(Config::new("streaming.idx", "streaming.kv")).await?;

    // One key, many docids
    for chapter in 1..=5 {
        tree.insert(
            DocKey::new("novel", format!("chapter-{chapter}")),
            format!("text of chapter {chapter}"),
        )
        .await?;
    }
    tree.insert(DocKey::new("essay", "chapter-1"), "a short essay")
        .await?;
    tree.drain().await?;

    // Stream every value recorded under "novel", in docid order
    let mut chapters = Box::pin(tree.lookup(b"novel").await);
    while let Some(value) = chapters.next().await {
        println!("novel: {}", String::from_utf8_lossy(&value));
    }

    // Stream the whole index in reverse order
    let mut entries = Box::pin(tree.full_set(Direction::Descending).await);
    while let Some((key, docid, value)) = entries.next().await {
        println!(
            "{}:{} = {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&docid),
            String::from_utf8_lossy(&value)
        );
    }

    tree.destroy().await?;
    Ok(())
}
