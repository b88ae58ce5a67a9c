use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use parking_lot::Mutex;

use med_classify::mocks::ColorClassifier;
use med_classify::{
    ClassificationService, ClassifierSpec, Config, Detection, DetectorSpec, ImageClassifier,
    ModelFactory, ObjectDetector,
};

/// Detector that reports when it starts and blocks until released.
struct GatedDetector {
    entered: Sender<()>,
    release: Arc<Mutex<Receiver<()>>>,
    calls: Arc<AtomicUsize>,
}

impl ObjectDetector for GatedDetector {
    fn recognize_image(&self, _image: &RgbImage) -> med_classify::Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered.send(());
        let _ = self.release.lock().recv();
        Ok(Vec::new())
    }

    fn input_size(&self) -> u32 {
        300
    }
}

struct GatedFactory {
    entered: Sender<()>,
    release: Arc<Mutex<Receiver<()>>>,
    detector_calls: Arc<AtomicUsize>,
    detector_creations: Arc<AtomicUsize>,
    classifier_creations: Arc<AtomicUsize>,
}

impl ModelFactory for GatedFactory {
    fn create_detector(
        &self,
        _spec: &DetectorSpec,
    ) -> med_classify::Result<Arc<dyn ObjectDetector>> {
        self.detector_creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(GatedDetector {
            entered: self.entered.clone(),
            release: Arc::clone(&self.release),
            calls: Arc::clone(&self.detector_calls),
        }))
    }

    fn create_classifier(
        &self,
        _spec: &ClassifierSpec,
    ) -> med_classify::Result<Arc<dyn ImageClassifier>> {
        self.classifier_creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ColorClassifier::new(Default::default())))
    }
}

struct Harness {
    service: Arc<ClassificationService<GatedFactory>>,
    entered: Receiver<()>,
    release: Sender<()>,
    ready: Arc<AtomicUsize>,
    detector_calls: Arc<AtomicUsize>,
    detector_creations: Arc<AtomicUsize>,
    classifier_creations: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    let detector_calls = Arc::new(AtomicUsize::new(0));
    let detector_creations = Arc::new(AtomicUsize::new(0));
    let classifier_creations = Arc::new(AtomicUsize::new(0));
    let ready = Arc::new(AtomicUsize::new(0));

    let factory = GatedFactory {
        entered: entered_tx,
        release: Arc::new(Mutex::new(release_rx)),
        detector_calls: Arc::clone(&detector_calls),
        detector_creations: Arc::clone(&detector_creations),
        classifier_creations: Arc::clone(&classifier_creations),
    };
    let ready_count = Arc::clone(&ready);
    let service = ClassificationService::new(factory, Config::default())
        .unwrap()
        .with_ready_callback(move || {
            ready_count.fetch_add(1, Ordering::SeqCst);
        });

    Harness {
        service: Arc::new(service),
        entered: entered_rx,
        release: release_tx,
        ready,
        detector_calls,
        detector_creations,
        classifier_creations,
    }
}

fn image() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::new(64, 48))
}

fn spawn_call(
    service: &Arc<ClassificationService<GatedFactory>>,
) -> tokio::task::JoinHandle<med_classify::Result<Option<String>>> {
    let service = Arc::clone(service);
    tokio::spawn(async move { service.process_image(&image()).await })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_call_is_dropped() {
    let Harness {
        service,
        entered,
        release,
        ready,
        detector_calls,
        detector_creations,
        classifier_creations,
    } = harness();

    let first = spawn_call(&service);
    let entered = tokio::task::spawn_blocking(move || {
        entered.recv().unwrap();
        entered
    })
    .await
    .unwrap();
    assert!(service.is_computing());

    let second = service.process_image(&image()).await.unwrap();
    assert_eq!(second, None);
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert_eq!(detector_calls.load(Ordering::SeqCst), 1);
    assert_eq!(detector_creations.load(Ordering::SeqCst), 1);
    assert_eq!(classifier_creations.load(Ordering::SeqCst), 1);

    release.send(()).unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.as_deref(), Some("[]"));
    assert!(!service.is_computing());

    // once the first call finished, new calls run normally
    release.send(()).unwrap();
    let third = service.process_image(&image()).await.unwrap();
    assert_eq!(third.as_deref(), Some("[]"));
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert_eq!(detector_calls.load(Ordering::SeqCst), 2);
    drop(entered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_runs_exactly_one_call() {
    let Harness {
        service,
        entered,
        release,
        ready,
        detector_calls,
        ..
    } = harness();

    let first = spawn_call(&service);
    tokio::task::spawn_blocking(move || entered.recv().unwrap())
        .await
        .unwrap();

    let burst: Vec<_> = (0..7).map(|_| spawn_call(&service)).collect();
    for handle in burst {
        assert_eq!(handle.await.unwrap().unwrap(), None);
    }
    assert_eq!(ready.load(Ordering::SeqCst), 7);

    release.send(()).unwrap();
    assert!(first.await.unwrap().unwrap().is_some());
    assert_eq!(detector_calls.load(Ordering::SeqCst), 1);
}
