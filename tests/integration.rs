use std::{fs, path::Path};

use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{s, Array1, Array2, Array3};
use tcalayout::{
    coco::{CocoAnnotation, CocoImage},
    dataset::VAL_SPLIT,
    evaluation,
    overlay::OverlayStyle,
    runner::{FolderRunner, IdScope, RunnerOptions},
    Category, CategoryIndex, CocoFile, DatasetRegistry, DetectionOptions, InstanceSegmenter,
    LayoutAnalyzer, RawPrediction,
};

const SIZE: u32 = 40;
const RED: Rgb<u8> = Rgb([200, 30, 30]);
const BLUE: Rgb<u8> = Rgb([30, 30, 200]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// `(category, score, [x, y, w, h])`
type Instance = (Category, f32, [usize; 4]);

/// Predicts a fixed layout chosen by the colour of the top-left pixel.
struct ColourSegmenter;

impl ColourSegmenter {
    fn layout(colour: Rgb<u8>) -> Vec<Instance> {
        if colour == RED {
            vec![
                (Category::Text, 0.95, [2, 2, 16, 16]),
                (Category::Image, 0.9, [2, 22, 36, 16]),
                (Category::Table, 0.3, [20, 2, 16, 16]),
            ]
        } else if colour == BLUE {
            vec![(Category::Title, 0.99, [4, 4, 30, 10])]
        } else {
            vec![]
        }
    }
}

impl InstanceSegmenter for ColourSegmenter {
    fn predict(&self, image: &DynamicImage) -> tcalayout::Result<RawPrediction> {
        let rgb = image.to_rgb8();
        let instances = Self::layout(*rgb.get_pixel(0, 0));
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let mut prediction = RawPrediction {
            boxes: Array2::zeros((instances.len(), 4)),
            labels: Array1::zeros(instances.len()),
            scores: Array1::zeros(instances.len()),
            masks: Array3::zeros((instances.len(), height, width)),
        };
        for (i, (category, score, [x, y, w, h])) in instances.into_iter().enumerate() {
            prediction.boxes.row_mut(i).assign(&Array1::from(vec![
                x as f32,
                y as f32,
                (x + w) as f32,
                (y + h) as f32,
            ]));
            prediction.labels[i] = category.id() as i64;
            prediction.scores[i] = score;
            prediction
                .masks
                .slice_mut(s![i, y..y + h, x..x + w])
                .fill(0.9);
        }
        Ok(prediction)
    }
}

fn write_page(path: &Path, colour: Rgb<u8>) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(SIZE, SIZE, colour).save(path).unwrap();
}

fn index() -> CategoryIndex {
    CategoryIndex::from(&Category::ALL[..])
}

fn input_tree(root: &Path) {
    write_page(&root.join("a/1.png"), RED);
    write_page(&root.join("a/2.png"), WHITE);
    fs::write(root.join("a/notes.txt"), "not an image").unwrap();
    write_page(&root.join("a/nested/3.png"), BLUE);
    fs::create_dir_all(root.join("b")).unwrap();
    fs::write(root.join("b/broken.png"), b"definitely not a png").unwrap();
}

fn run(id_scope: IdScope) -> (tempfile::TempDir, tcalayout::runner::RunSummary) {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    input_tree(&input);
    let analyzer = LayoutAnalyzer::with_segmenter(ColourSegmenter);
    let index = index();
    let style = OverlayStyle::default();
    let options = RunnerOptions {
        id_scope,
        ..RunnerOptions::default()
    };
    let summary = FolderRunner::new(&analyzer, &index, &style, options)
        .run(&input, &dir.path().join("output"))
        .unwrap();
    (dir, summary)
}

#[test]
fn folder_run_writes_overlays_and_results() {
    let (dir, summary) = run(IdScope::PerFolder);
    let output = dir.path().join("output");

    assert_eq!(summary.folders, 3);
    assert_eq!(summary.images, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.annotations, 3);

    assert!(output.join("a/result_1.png").is_file());
    assert!(output.join("a/result_2.png").is_file());
    assert!(!output.join("a/result_notes.txt").exists());
    assert!(output.join("nested/result_3.png").is_file());
    assert!(!output.join("b/result_broken.png").exists());

    let a = CocoFile::load(output.join("a/results.json")).unwrap();
    let names = a
        .images
        .iter()
        .map(|it| (it.id, it.file_name.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(names, vec![(0, "1.png"), (1, "2.png")]);
    assert_eq!(a.images[0].width, SIZE);
    assert_eq!(a.categories.len(), 4);
    // the low-confidence table is filtered out
    let categories = a
        .annotations
        .iter()
        .map(|it| it.category_id)
        .collect::<Vec<_>>();
    assert_eq!(categories, vec![Category::Text.id(), Category::Image.id()]);
    assert_eq!(a.annotations_for(1).count(), 0);

    let text = &a.annotations[0];
    assert_eq!(text.bbox, [2.0, 2.0, 16.0, 16.0]);
    assert_eq!(text.area, 256.0);
    assert_eq!(text.iscrowd, 0);
    for polygon in text.segmentation.polygons() {
        assert!(polygon.len() >= 6 && polygon.len() <= 62);
        assert_eq!(polygon[..2], polygon[polygon.len() - 2..]);
        for xy in polygon.chunks_exact(2) {
            assert!((2.0..18.0).contains(&xy[0]) && (2.0..18.0).contains(&xy[1]));
        }
    }

    let nested = CocoFile::load(output.join("nested/results.json")).unwrap();
    assert_eq!(nested.images[0].id, 0);
    assert_eq!(nested.annotations[0].id, 0);

    let b = CocoFile::load(output.join("b/results.json")).unwrap();
    assert!(b.images.is_empty());
    assert!(b.annotations.is_empty());
}

#[test]
fn global_ids_continue_across_folders() {
    let (dir, _) = run(IdScope::Global);
    let nested = CocoFile::load(dir.path().join("output/nested/results.json")).unwrap();
    assert_eq!(nested.images[0].id, 2);
    assert_eq!(nested.annotations[0].id, 2);
    assert_eq!(nested.annotations[0].image_id, 2);
}

#[test]
fn results_file_is_pretty_printed() {
    let (dir, _) = run(IdScope::PerFolder);
    let raw = fs::read_to_string(dir.path().join("output/a/results.json")).unwrap();
    assert!(raw.contains("\n  \"images\": ["));
}

fn ground_truth(id: u64, colour: Rgb<u8>, coco: &mut CocoFile) {
    coco.images.push(CocoImage {
        id,
        file_name: format!("{id}.png"),
        width: SIZE,
        height: SIZE,
    });
    for (category, score, [x, y, w, h]) in ColourSegmenter::layout(colour) {
        if score < 0.5 {
            continue;
        }
        coco.annotations.push(CocoAnnotation {
            id: coco.annotations.len() as u64,
            image_id: id,
            category_id: category.id(),
            segmentation: Default::default(),
            bbox: [x as f32, y as f32, w as f32, h as f32],
            area: (w * h) as f64,
            iscrowd: 0,
            ignore: 0,
        });
    }
}

#[test]
fn evaluation_on_registered_split() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let registry = DatasetRegistry::new(dir.path());
    let split = registry.get(VAL_SPLIT).unwrap();
    let mut coco = CocoFile::default();
    for (id, colour) in [RED, BLUE, WHITE].into_iter().enumerate() {
        write_page(&split.image_path(&format!("{id}.png")), colour);
        ground_truth(id as u64, colour, &mut coco);
    }
    fs::create_dir_all(split.annotation_file.parent().unwrap()).unwrap();
    coco.save(&split.annotation_file).unwrap();

    let analyzer = LayoutAnalyzer::with_segmenter(ColourSegmenter);
    let options = DetectionOptions {
        score_threshold: 0.5,
        ..DetectionOptions::default()
    };
    let report = evaluation::evaluate(&analyzer, split, options).unwrap();
    assert_eq!(report.images, 3);
    assert_eq!(report.bbox.ap, 1.0);
    assert_eq!(report.segm.ap, 1.0);
    assert!((report.readability.rho - 1.0).abs() < 1e-12);
    assert_eq!(report.readability.mse, 0.0);
}

#[test]
fn crowd_rle_ground_truth_does_not_abort_evaluation() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let registry = DatasetRegistry::new(dir.path());
    let split = registry.get(VAL_SPLIT).unwrap();
    let mut coco = CocoFile::default();
    for (id, colour) in [RED, BLUE, WHITE].into_iter().enumerate() {
        write_page(&split.image_path(&format!("{id}.png")), colour);
        ground_truth(id as u64, colour, &mut coco);
    }
    let mut json = serde_json::to_value(&coco).unwrap();
    json["annotations"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({
            "id": 100,
            "image_id": 2,
            "category_id": Category::Table.id(),
            "segmentation": {"size": [SIZE, SIZE], "counts": "03"},
            "bbox": [0, 0, 1, 3],
            "area": 3,
            "iscrowd": 1
        }));
    fs::create_dir_all(split.annotation_file.parent().unwrap()).unwrap();
    fs::write(&split.annotation_file, serde_json::to_string(&json).unwrap()).unwrap();

    let analyzer = LayoutAnalyzer::with_segmenter(ColourSegmenter);
    let options = DetectionOptions {
        score_threshold: 0.5,
        ..DetectionOptions::default()
    };
    let report = evaluation::evaluate(&analyzer, split, options).unwrap();
    assert_eq!(report.images, 3);
    assert_eq!(report.bbox.ap, 1.0);
    assert_eq!(report.segm.ap, 1.0);
}

#[test]
fn repeated_folder_names_do_not_overwrite_results() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_page(&input.join("p/scans/1.png"), RED);
    write_page(&input.join("q/scans/2.png"), BLUE);
    let analyzer = LayoutAnalyzer::with_segmenter(ColourSegmenter);
    let index = index();
    let style = OverlayStyle::default();
    let output = dir.path().join("output");
    FolderRunner::new(&analyzer, &index, &style, RunnerOptions::default())
        .run(&input, &output)
        .unwrap();

    let first = CocoFile::load(output.join("scans/results.json")).unwrap();
    let second = CocoFile::load(output.join("scans_2/results.json")).unwrap();
    assert_eq!(first.images[0].file_name, "1.png");
    assert_eq!(second.images[0].file_name, "2.png");
}

#[test]
fn missing_annotation_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DatasetRegistry::new(dir.path());
    let analyzer = LayoutAnalyzer::with_segmenter(ColourSegmenter);
    let split = registry.get(VAL_SPLIT).unwrap();
    assert!(evaluation::evaluate(&analyzer, split, DetectionOptions::default()).is_err());
}
