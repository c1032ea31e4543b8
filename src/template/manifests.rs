//! Embedded etcd manifest templates
//!
//! Every value comes from [`EtcdManifestContext`](super::EtcdManifestContext);
//! the templates reference nothing else. Claims follow the StatefulSet's
//! lifetime: they are deleted with it but kept across scale-down, so a
//! member that leaves and later rejoins has already purged its own data.

/// Mount point of the etcd TLS secret
pub const ETCD_PKI_DIR: &str = "/etc/strata/pki/etcd";

/// Mount point of the etcd data volume
pub const ETCD_VOLUME_DIR: &str = "/var/run/etcd";

pub(crate) const ETCD_STATEFULSET: &str = r#"apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: {{ statefulset_name }}
  namespace: {{ namespace }}
  labels:
    {%- for key, value in labels|items %}
    {{ key }}: "{{ value }}"
    {%- endfor %}
spec:
  replicas: {{ replicas }}
  serviceName: {{ statefulset_name }}
  podManagementPolicy: Parallel
  persistentVolumeClaimRetentionPolicy:
    whenDeleted: Delete
    whenScaled: Retain
  selector:
    matchLabels:
      {%- for key, value in selector_labels|items %}
      {{ key }}: "{{ value }}"
      {%- endfor %}
  template:
    metadata:
      labels:
        {%- for key, value in labels|items %}
        {{ key }}: "{{ value }}"
        {%- endfor %}
    spec:
      automountServiceAccountToken: false
      initContainers:
        - name: install-strata
          image: "{{ bootstrap_image }}"
          imagePullPolicy: IfNotPresent
          command:
            - strata
            - install-binary
            - --dest
            - /opt/strata/bin/strata
          volumeMounts:
            - mountPath: /opt/strata/bin
              name: strata-bin
      containers:
        - name: etcd
          image: "{{ image }}"
          imagePullPolicy: IfNotPresent
          command:
            - /opt/strata/bin/strata
            - etcd
            - start
          ports:
            - containerPort: {{ peer_port }}
              name: peer
              protocol: TCP
            - containerPort: {{ client_port }}
              name: client
              protocol: TCP
          env:
            - name: INITIAL_CLUSTER_SIZE
              value: "{{ replicas }}"
            - name: MY_NAMESPACE
              valueFrom:
                fieldRef:
                  fieldPath: metadata.namespace
            - name: POD_IP
              valueFrom:
                fieldRef:
                  fieldPath: status.podIP
            - name: POD_NAME
              valueFrom:
                fieldRef:
                  fieldPath: metadata.name
            - name: SET_NAME
              value: "{{ statefulset_name }}"
            - name: CLUSTER_DOMAIN
              value: "{{ cluster_domain }}"
            - name: ETCD_CLIENT_PORT
              value: "{{ client_port }}"
            - name: ETCD_PEER_PORT
              value: "{{ peer_port }}"
          lifecycle:
            preStop:
              exec:
                command:
                  - /opt/strata/bin/strata
                  - etcd
                  - stop
          livenessProbe:
            exec:
              command:
                - etcdctl
                - get
                - /registry
                - --prefix
                - --keys-only
                - --endpoints=https://127.0.0.1:{{ client_port }}
                - --cacert=/etc/strata/pki/etcd/ca.crt
                - --cert=/etc/strata/pki/etcd/server.crt
                - --key=/etc/strata/pki/etcd/server.key
            failureThreshold: 3
            initialDelaySeconds: 600
            periodSeconds: 60
            successThreshold: 1
            timeoutSeconds: 10
          volumeMounts:
            - mountPath: /var/run/etcd
              name: {{ volume_name }}
            - mountPath: /etc/strata/pki/etcd
              name: etcd-cert
              readOnly: true
            - mountPath: /opt/strata/bin
              name: strata-bin
      volumes:
        - name: etcd-cert
          secret:
            secretName: {{ certs_secret_name }}
        - name: strata-bin
          emptyDir: {}
  volumeClaimTemplates:
    - metadata:
        name: {{ volume_name }}
        labels:
          {%- for key, value in labels|items %}
          {{ key }}: "{{ value }}"
          {%- endfor %}
      spec:
        {%- if storage_class_name %}
        storageClassName: {{ storage_class_name }}
        {%- endif %}
        accessModes:
        {%- for mode in access_modes %}
          - {{ mode }}
        {%- endfor %}
        resources:
          requests:
            storage: "{{ storage_size }}"
"#;

pub(crate) const ETCD_CLIENT_SERVICE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: {{ client_service_name }}
  namespace: {{ namespace }}
  labels:
    {%- for key, value in labels|items %}
    {{ key }}: "{{ value }}"
    {%- endfor %}
spec:
  type: ClusterIP
  ports:
    - name: client
      port: {{ client_port }}
      protocol: TCP
      targetPort: {{ client_port }}
  selector:
    {%- for key, value in selector_labels|items %}
    {{ key }}: "{{ value }}"
    {%- endfor %}
"#;

pub(crate) const ETCD_PEER_SERVICE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: {{ statefulset_name }}
  namespace: {{ namespace }}
  labels:
    {%- for key, value in labels|items %}
    {{ key }}: "{{ value }}"
    {%- endfor %}
spec:
  clusterIP: None
  publishNotReadyAddresses: true
  ports:
    - name: client
      port: {{ client_port }}
      protocol: TCP
      targetPort: {{ client_port }}
    - name: peer
      port: {{ peer_port }}
      protocol: TCP
      targetPort: {{ peer_port }}
  selector:
    {%- for key, value in selector_labels|items %}
    {{ key }}: "{{ value }}"
    {%- endfor %}
"#;
