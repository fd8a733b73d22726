mod common;

use common::Fixture;

#[test]
fn set_list_and_get_xattr() {
    let fx = Fixture::new();
    fx.write_whole("/basic.txt", b"hello world\n");

    fx.engine.set_xattr("/basic.txt", "user.author", b"Soham").unwrap();

    assert_eq!(fx.engine.list_xattr("/basic.txt").unwrap(), vec!["user.author".to_string()]);
    assert_eq!(fx.engine.get_xattr("/basic.txt", "user.author").unwrap(), b"Soham");
}

#[test]
fn get_missing_xattr_is_no_xattr() {
    let fx = Fixture::new();
    fx.write_whole("/basic.txt", b"data");
    let err = fx.engine.get_xattr("/basic.txt", "user.missing").unwrap_err();
    assert!(matches!(err, wormfs::OverlayError::NoXattr));
}

#[test]
fn remove_xattr_drops_just_that_key() {
    let fx = Fixture::new();
    fx.write_whole("/basic.txt", b"data");
    fx.engine.set_xattr("/basic.txt", "user.a", b"1").unwrap();
    fx.engine.set_xattr("/basic.txt", "user.b", b"2").unwrap();

    fx.engine.remove_xattr("/basic.txt", "user.a").unwrap();

    assert_eq!(fx.engine.list_xattr("/basic.txt").unwrap(), vec!["user.b".to_string()]);
    assert!(matches!(fx.engine.get_xattr("/basic.txt", "user.a"), Err(wormfs::OverlayError::NoXattr)));
}
