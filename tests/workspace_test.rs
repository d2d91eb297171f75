use autoshorts::Workspace;

#[test]
fn video_names_come_from_the_topic() {
    let ws = Workspace::new("root");
    assert!(ws.video_file("Octopus facts").ends_with("Video/Octopus facts.mp4"));
    assert!(
        ws.captioned_video_file("cats/dogs")
            .ends_with("Video/cats_dogs_captioned.mp4")
    );
}
