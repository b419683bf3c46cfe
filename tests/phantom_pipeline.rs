use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use voxel_phantom::config::{FluxUnit, load_config_with};
use voxel_phantom::export::{ExportOptions, export_run, read_dataset, read_records, write_text_dump};
use voxel_phantom::scoring::{Species, Step};
use voxel_phantom::spectrum::DECAY_PROCESS;
use voxel_phantom::{PhantomContext, PhantomError, RunCoordinator, Worker};

/// 14 element columns: H C N O Na Mg P S Cl Ar K Ca Fe I
fn composition_row(tag: u32, h: f64, o: f64, density: f64) -> String {
    let mut columns = vec!["0".to_string(); 14];
    columns[0] = h.to_string();
    columns[3] = o.to_string();
    format!("{tag} {} {density}\n", columns.join(" "))
}

/// 2 x 2 x 2 phantom in two slices, dense source map, 1 mm voxels.
fn write_fixture(root: &Path) {
    let phantom = root.join("phantom");
    fs::create_dir_all(&phantom).unwrap();

    let mut composition = String::from("2\n");
    composition.push_str(&composition_row(5, 11.2, 88.8, 1.0));
    composition.push_str(&composition_row(9, 10.0, 90.0, 1.05));
    fs::write(phantom.join("ECompDensity.txt"), composition).unwrap();
    fs::write(phantom.join("OrgantagvsName.txt"), "5 Water\n9 Liver\n").unwrap();

    fs::write(phantom.join("Data.dat"), "0\n2\nslice0.g4m\nslice1.g4m\n").unwrap();
    fs::write(
        phantom.join("slice0.g4m"),
        "2 2 1\n-1 1\n-1 1\n0 1\n5 5\n9 0\n",
    )
    .unwrap();
    fs::write(
        phantom.join("slice1.g4m"),
        "2 2 1\n-1 1\n-1 1\n1 2\n9 9\n5 0\n",
    )
    .unwrap();

    fs::write(phantom.join("Energybin1.txt"), "2\n100 1000\n").unwrap();
    fs::write(phantom.join("OrgantagOfInterest.txt"), "1\n9\n").unwrap();

    let source = root.join("source");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("Data.dat"), "2\ndose0.txt\ndose1.txt\n").unwrap();
    fs::write(source.join("dose0.txt"), "2 2 1\n-1 1\n-1 1\n0 1\n0 1\n0 3\n").unwrap();
    fs::write(source.join("dose1.txt"), "2 2 1\n-1 1\n-1 1\n1 2\n0 0\n0 0\n").unwrap();

    fs::write(
        root.join("voxel_phantom.toml"),
        r#"
[phantom]
data_dir = "phantom"

[source]
path = "source/Data.dat"

[scoring]
species = ["gamma"]
weighted_flux = true

[run]
workers = 2
seed = 99
"#,
    )
    .unwrap();
}

fn build_context(root: &Path) -> PhantomContext {
    let config = load_config_with(&root.join("voxel_phantom.toml"), |_| None).unwrap();
    PhantomContext::build(&config).unwrap()
}

fn photon_step(replicas: [i64; 3], material: usize, energy: f64) -> Step {
    let mut step = Step::new(Species::Photon, energy, material);
    step.touchable.replicas = replicas;
    step.step_length = 0.5;
    step.energy_deposit = 2.0;
    step
}

#[test]
fn context_builds_from_files() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let context = build_context(dir.path());

    assert_eq!(context.geometry.shape(), [2, 2, 2]);
    assert_eq!(context.geometry.slice_count(), 2);
    assert_eq!(context.catalog.len(), 3);
    // tag 9 -> Liver, second catalogued material
    assert_eq!(context.geometry.material_at(0, 1, 0).unwrap(), 2);
    assert_eq!(context.geometry.material_at(1, 1, 1).unwrap(), 0);
    assert_eq!(context.geometry.voxel_volume(), 1.0);

    let entries: Vec<_> = context.source.entries().collect();
    assert_eq!(entries, vec![(0.25, 1), (1.0, 3)]);
    assert_eq!(context.source.grid().shape, [2, 2, 2]);

    let summary = context.summary();
    assert_eq!(summary.materials_of_interest, vec![2]);
    assert_eq!(summary.energy_bins.len(), 2);
    assert_eq!(summary.materials[1].name, "Water");
}

#[test]
fn sampled_vertices_come_from_positive_voxels() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let context = build_context(dir.path());

    let mut worker = Worker::new(0, &context, 99);
    let mut counts = [0usize; 8];
    for event in 0..4000 {
        worker.begin_event(event);
        let vertex = worker.generate_primary().unwrap();
        counts[vertex.voxel] += 1;
        assert_eq!(vertex.position[2], 0.5);
        worker.end_of_event();
    }
    assert_eq!(worker.events(), 4000);
    assert_eq!(counts[0] + counts[2] + counts[4..].iter().sum::<usize>(), 0);
    let fraction = counts[1] as f64 / 4000.0;
    assert!((fraction - 0.25).abs() < 0.03, "voxel 1 drawn {fraction}");
}

#[test]
fn workers_score_reduce_and_export() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let context = build_context(dir.path());

    let coordinator = RunCoordinator::new();
    for index in 0..2 {
        let mut worker = Worker::new(index, &context, 99);
        worker.begin_event(index as u64);
        // Liver voxel (0, 1, 0): nested replicas are [z, x, y]
        assert_eq!(worker.process_step(&photon_step([0, 0, 1], 2, 50.0)), 2);
        // Water voxel: deposit only
        assert_eq!(worker.process_step(&photon_step([0, 0, 0], 1, 500.0)), 1);

        let mut decay = Step::new(Species::Photon, 140.5, 1);
        decay.track.track_id = 2;
        decay.track.step_number = 1;
        decay.track.creator_process = Some(DECAY_PROCESS.to_string());
        worker.process_step(&decay);
        worker.end_of_event();

        coordinator.submit(worker.finish()).unwrap();
    }
    let result = coordinator.finish().unwrap();
    assert_eq!(result.events, 2);
    assert_eq!(result.spectra.photon.counts[140], 2.0);

    let out = dir.path().join("output");
    let options = ExportOptions {
        binary: true,
        flux_unit: FluxUnit::PerCm2,
    };
    export_run(&out, &result, &options).unwrap();

    let edep = read_dataset(&out.join("Edep.json")).unwrap();
    assert_eq!(edep.records.len(), 2);
    assert_eq!(edep.records[0].value, 4.0);

    let fluence = read_dataset(&out.join("Fluence01.json")).unwrap();
    assert_eq!(fluence.records.len(), 1);
    let record = fluence.records[0];
    assert_eq!((record.x, record.y, record.z), (0, 1, 0));
    // two steps of 0.5 mm in a 1 mm^3 voxel, reported per cm^2
    assert_relative_eq!(record.value, 100.0);
    assert!(read_dataset(&out.join("Fluence02.json")).unwrap().records.is_empty());

    let binary = read_records(&out.join("Fluence01.bin")).unwrap();
    let mut text = Vec::new();
    write_text_dump(&binary, &mut text).unwrap();
    assert_eq!(String::from_utf8(text).unwrap(), "      0\t      1\t      0\t100.00000000\n");

    assert!(matches!(
        export_run(&out, &result, &options),
        Err(PhantomError::DataIntegrity { .. })
    ));
}

#[test]
fn unknown_tag_in_slice_stops_setup() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    fs::write(
        dir.path().join("phantom/slice1.g4m"),
        "2 2 1\n-1 1\n-1 1\n1 2\n9 9\n5 42\n",
    )
    .unwrap();

    let config = load_config_with(&dir.path().join("voxel_phantom.toml"), |_| None).unwrap();
    match PhantomContext::build(&config) {
        Err(PhantomError::UnknownTag { tag, file }) => {
            assert_eq!(tag, 42);
            assert!(file.unwrap().ends_with("slice1.g4m"));
        }
        other => panic!("unexpected {other:?}"),
    }
}
