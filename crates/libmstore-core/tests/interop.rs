//! Known-tree vectors shared with other Merkle Search Tree implementations
//!
//! Every root CID below is published by the deployed network's reference
//! implementation; matching them byte-for-byte is what makes repositories
//! exchangeable.

use libmstore_core::{BlockStore, Cid, Fanout, MemoryBlockStore, Mst};

const LEAF_VALUE: &str = "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454";

fn cid(s: &str) -> Cid {
    s.parse().unwrap()
}

fn key(suffix: &str) -> String {
    format!("com.example.record/3jqfcqzm{}", suffix)
}

fn add_all<S: BlockStore>(mst: &Mst<'_, S>, root: Cid, suffixes: &[&str]) -> Cid {
    let value = cid(LEAF_VALUE);
    suffixes
        .iter()
        .fold(root, |root, s| mst.insert(&root, &key(s), &value).unwrap())
}

#[test]
fn test_empty_tree() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let root = mst.create_empty().unwrap();
    assert_eq!(mst.leaf_count(&root).unwrap(), 0);
    assert_eq!(root, cid("bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm"));
}

#[test]
fn test_trivial_tree() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let root = add_all(&mst, mst.create_empty().unwrap(), &["3fo2j"]);
    assert_eq!(mst.leaf_count(&root).unwrap(), 1);
    assert_eq!(root, cid("bafyreibj4lsc3aqnrvphp5xmrnfoorvru4wynt6lwidqbm2623a6tatzdu"));
}

#[test]
fn test_single_layer_two_tree() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let root = add_all(&mst, mst.create_empty().unwrap(), &["3fx2j"]);
    assert_eq!(mst.leaf_count(&root).unwrap(), 1);
    assert_eq!(mst.layer(&root).unwrap(), 2);
    assert_eq!(root, cid("bafyreih7wfei65pxzhauoibu3ls7jgmkju4bspy4t2ha2qdjnzqvoy33ai"));
}

#[test]
fn test_simple_tree() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let root = add_all(
        &mst,
        mst.create_empty().unwrap(),
        &["3fp2j", "3fr2j", "3fs2j", "3ft2j", "4fc2j"],
    );
    assert_eq!(mst.leaf_count(&root).unwrap(), 5);
    assert_eq!(root, cid("bafyreicmahysq4n6wfuxo522m6dpiy7z7qzym3dzs756t5n7nfdgccwq7m"));
}

#[test]
fn test_trims_top_on_delete() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let l1root = cid("bafyreifnqrwbk6ffmyaz5qtujqrzf5qmxf7cbxvgzktl4e3gabuxbtatv4");
    let l0root = cid("bafyreie4kjuxbwkhzg2i5dljaswcroeih4dgiqq6pazcmunwt2byd725vi");

    let root = add_all(
        &mst,
        mst.create_empty().unwrap(),
        &["3fn2j", "3fo2j", "3fp2j", "3fs2j", "3ft2j", "3fu2j"],
    );
    assert_eq!(mst.leaf_count(&root).unwrap(), 6);
    assert_eq!(mst.layer(&root).unwrap(), 1);
    assert_eq!(root, l1root);

    let root = mst.delete(&root, &key("3fs2j")).unwrap().unwrap();
    assert_eq!(mst.leaf_count(&root).unwrap(), 5);
    assert_eq!(mst.layer(&root).unwrap(), 0);
    assert_eq!(root, l0root);
}

#[test]
fn test_insertion_splits_two_layers_down() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let l1root = cid("bafyreiettyludka6fpgp33stwxfuwhkzlur6chs4d2v4nkmq2j3ogpdjem");
    let l2root = cid("bafyreid2x5eqs4w4qxvc5jiwda4cien3gw2q6cshofxwnvv7iucrmfohpm");

    let root = add_all(
        &mst,
        mst.create_empty().unwrap(),
        &[
            "3fo2j", "3fp2j", "3fr2j", "3fs2j", "3ft2j", "3fz2j", "4fc2j", "4fd2j", "4ff2j",
            "4fg2j", "4fh2j",
        ],
    );
    assert_eq!(mst.leaf_count(&root).unwrap(), 11);
    assert_eq!(mst.layer(&root).unwrap(), 1);
    assert_eq!(root, l1root);

    let root = add_all(&mst, root, &["3fx2j"]);
    assert_eq!(mst.leaf_count(&root).unwrap(), 12);
    assert_eq!(mst.layer(&root).unwrap(), 2);
    assert_eq!(root, l2root);

    let root = mst.delete(&root, &key("3fx2j")).unwrap().unwrap();
    assert_eq!(mst.leaf_count(&root).unwrap(), 11);
    assert_eq!(mst.layer(&root).unwrap(), 1);
    assert_eq!(root, l1root);
}

#[test]
fn test_new_layers_two_higher_than_existing() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let l0root = cid("bafyreidfcktqnfmykz2ps3dbul35pepleq7kvv526g47xahuz3rqtptmky");
    let l2root = cid("bafyreiavxaxdz7o7rbvr3zg2liox2yww46t7g6hkehx4i4h3lwudly7dhy");
    let l2root2 = cid("bafyreig4jv3vuajbsybhyvb7gggvpwh2zszwfyttjrj6qwvcsp24h6popu");

    let root = add_all(&mst, mst.create_empty().unwrap(), &["3ft2j", "3fz2j"]);
    assert_eq!(mst.leaf_count(&root).unwrap(), 2);
    assert_eq!(mst.layer(&root).unwrap(), 0);
    assert_eq!(root, l0root);

    let root = add_all(&mst, root, &["3fx2j"]);
    assert_eq!(mst.leaf_count(&root).unwrap(), 3);
    assert_eq!(mst.layer(&root).unwrap(), 2);
    assert_eq!(root, l2root);

    let root = mst.delete(&root, &key("3fx2j")).unwrap().unwrap();
    assert_eq!(mst.leaf_count(&root).unwrap(), 2);
    assert_eq!(mst.layer(&root).unwrap(), 0);
    assert_eq!(root, l0root);

    let root = add_all(&mst, root, &["3fx2j", "4fd2j"]);
    assert_eq!(mst.leaf_count(&root).unwrap(), 4);
    assert_eq!(mst.layer(&root).unwrap(), 2);
    assert_eq!(root, l2root2);

    let root = mst.delete(&root, &key("4fd2j")).unwrap().unwrap();
    assert_eq!(mst.leaf_count(&root).unwrap(), 3);
    assert_eq!(mst.layer(&root).unwrap(), 2);
    assert_eq!(root, l2root);
}

#[test]
fn test_vectors_are_order_independent() {
    let store = MemoryBlockStore::new();
    let mst = Mst::new(&store);
    let mut suffixes = vec![
        "3fo2j", "3fp2j", "3fr2j", "3fs2j", "3ft2j", "3fz2j", "4fc2j", "4fd2j", "4ff2j", "4fg2j",
        "4fh2j",
    ];
    suffixes.reverse();
    let root = add_all(&mst, mst.create_empty().unwrap(), &suffixes);
    assert_eq!(root, cid("bafyreiettyludka6fpgp33stwxfuwhkzlur6chs4d2v4nkmq2j3ogpdjem"));
}

#[test]
fn test_fanout_changes_shape_not_contents() {
    let store = MemoryBlockStore::new();
    let narrow = Mst::new(&store);
    let wide = Mst::with_fanout(&store, Fanout::new(16).unwrap());
    let suffixes = ["3fo2j", "3fp2j", "3fr2j", "3fs2j", "3ft2j", "3fx2j"];

    let narrow_root = add_all(&narrow, narrow.create_empty().unwrap(), &suffixes);
    let wide_root = add_all(&wide, wide.create_empty().unwrap(), &suffixes);
    assert_ne!(narrow_root, wide_root);
    assert_eq!(narrow.leaves(&narrow_root).unwrap(), wide.leaves(&wide_root).unwrap());
}
