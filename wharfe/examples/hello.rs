use anyhow::Result;

use wharfe::btree::DocKey;
use wharfe::btree::Wharfe;
use wharfe::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Create an index backed by hello.idx and hello.kv
    let tree = Wharfe::try_new(Config::new("hello.idx", "hello.kv")).await?;

    // Make sure we can't find "something" in our tree
    assert!(!tree.contains(&DocKey::new("something", "doc-1")).await?);

    tree.insert(DocKey::new("something", "doc-1"), "a value").await?;

    // Make sure we can find "something" in our tree
    assert!(tree.contains(&DocKey::new("something", "doc-1")).await?);
    assert!(tree.equals(&DocKey::new("something", "doc-1")).await?);
    assert!(!tree.equals(&DocKey::new("something", "doc-2")).await?);

    tree.destroy().await?;
    Ok(())
}
